// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # varnishlog
//!
//! Reads the Varnish shared-memory log and ships one structured event per
//! client transaction.
//!
//! ## Architecture
//!
//! ```text
//! segment ──> decoder ──> assembler ──> mapper ──> sink
//!  (slots)   (RawRecord) (Transaction)  (Event)   (Ack | Retry | Drop)
//!                  \___________ controller ___________/
//! ```
//!
//! - [`segment`]: attach to a segment file, cursor and overrun detection
//! - [`decoder`]: one slot to one [`decoder::RawRecord`]
//! - [`assembler`]: groups records by vxid, folds backend fetches into their
//!   client parent, evicts idle transactions
//! - [`mapper`]: completed transaction to [`mapper::Event`]
//! - [`sink`]: the publish boundary and retry policy
//! - [`controller`]: lifecycle and the read loop

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![deny(unused_extern_crates)]
#![allow(clippy::module_name_repetitions)]

pub mod assembler;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod errors;
pub mod mapper;
pub mod payload;
pub mod segment;
pub mod sink;
pub mod transaction;

pub use controller::{Controller, PipelineHandle, PipelineStatus, PipelineSummary};
pub use mapper::Event;
pub use sink::{PublishSink, Verdict};
