// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event mapper: a pure function from a completed transaction to the event
//! handed to the sink.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::payload::{ByteCounts, HitInfo};
use crate::transaction::{seconds_to_ms, BackendSummary, CompletedTransaction, TransactionKind};

/// One shipped log event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Position of this event among those emitted by one pipeline run,
    /// starting at 1. `map` leaves it at 0; the controller numbers events.
    pub count: u64,
    /// Transaction start time.
    pub timestamp: Option<DateTime<Utc>>,
    pub vxid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_vxid: Option<u32>,
    pub kind: TransactionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    pub client_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    pub method: Option<String>,
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub status: Option<u16>,
    pub bytes: Option<u64>,
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<f64>,
    /// Set when records were missing or the transaction never saw its `End`.
    pub incomplete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acct: Option<ByteCounts>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub object_headers: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit: Option<HitInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<BackendSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vcl_calls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
}

#[must_use]
pub fn map(completed: &CompletedTransaction) -> Event {
    let tx = &completed.transaction;
    let start = tx
        .started_at
        .or_else(|| tx.ended_at.zip(tx.elapsed).map(|(end, elapsed)| end - elapsed));

    Event {
        count: 0,
        timestamp: start.and_then(to_datetime),
        vxid: tx.vxid,
        parent_vxid: tx.parent_vxid,
        kind: tx.kind,
        subtype: tx.subtype.clone(),
        client_ip: tx.client.as_ref().map(|client| client.ip),
        client_port: tx.client.as_ref().and_then(|client| client.port),
        method: tx.method.clone(),
        url: tx.url.clone(),
        protocol: tx.protocol.clone(),
        status: tx.status,
        bytes: tx.bytes(),
        duration_ms: tx.duration().map(seconds_to_ms),
        ttfb_ms: tx.ttfb.map(seconds_to_ms),
        incomplete: completed.is_incomplete(),
        acct: tx.acct,
        request_headers: tx.req_headers.clone(),
        response_headers: tx.resp_headers.clone(),
        object_headers: tx.obj_headers.clone(),
        hit: tx.hit,
        backends: tx.backends.clone(),
        vcl_calls: tx.vcl_calls.clone(),
        fetch_error: tx.fetch_error.clone(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let secs = seconds.trunc() as i64;
    let nanos = ((seconds.fract() * 1e9).round() as u32).min(999_999_999);
    Utc.timestamp_opt(secs, nanos).single()
}
