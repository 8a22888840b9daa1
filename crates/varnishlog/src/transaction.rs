// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction accumulator.
//!
//! A [`Transaction`] collects the fields of one client or backend request as
//! its records arrive. The [`Assembler`](crate::assembler::Assembler) owns
//! every open transaction and decides when it completes.

use std::collections::BTreeMap;
use std::time::Instant;

use fnv::FnvBuildHasher;
use hashbrown::HashSet;
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::config::IncludeHeaders;
use crate::decoder::{Marker, RawRecord, Tag};
use crate::payload::{
    parse_acct, parse_header, parse_hit, parse_req_start, parse_timestamp, parse_vxid_ref,
    ByteCounts, ClientAddr, HitInfo,
};

const CONTENT_LENGTH: &str = "content-length";

// Timestamp labels that can close a transaction; the last one seen wins.
const END_LABELS: [&str; 6] = ["Resp", "BerespBody", "Error", "Retry", "PipeSess", "Restart"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Client,
    Backend,
}

/// Why a transaction left the open set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// An `End` record arrived.
    End,
    /// No record arrived within the inactivity timeout.
    Evicted,
    /// A new `Begin` reused the id while it was still open.
    Superseded,
}

/// Header whitelists, matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct HeaderFilter {
    req: HashSet<String, FnvBuildHasher>,
    resp: HashSet<String, FnvBuildHasher>,
    obj: HashSet<String, FnvBuildHasher>,
}

impl HeaderFilter {
    #[must_use]
    pub fn new(include: &IncludeHeaders) -> Self {
        fn lowered(names: &[String]) -> HashSet<String, FnvBuildHasher> {
            names.iter().map(|name| name.to_ascii_lowercase()).collect()
        }
        Self {
            req: lowered(&include.req),
            resp: lowered(&include.resp),
            obj: lowered(&include.obj),
        }
    }

    fn allows(set: &HashSet<String, FnvBuildHasher>, name: &str) -> bool {
        !set.is_empty() && set.contains(&name.to_ascii_lowercase())
    }
}

/// What a finished backend fetch contributes to its client parent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendSummary {
    pub vxid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
    pub incomplete: bool,
}

/// Mutable accumulator for one vxid.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub vxid: u32,
    pub kind: TransactionKind,
    pub parent_vxid: Option<u32>,
    /// `Begin` reason, e.g. `rxreq`, `fetch`, `bgfetch`, `esi`.
    pub subtype: Option<String>,
    /// Set when the transaction is missing records.
    pub degraded: bool,
    pub method: Option<String>,
    pub url: Option<String>,
    pub protocol: Option<String>,
    pub status: Option<u16>,
    pub client: Option<ClientAddr>,
    /// Absolute `Start` time, seconds since the Unix epoch.
    pub started_at: Option<f64>,
    /// Absolute time of the latest closing timestamp.
    pub ended_at: Option<f64>,
    /// Since-start value of the latest closing timestamp.
    pub elapsed: Option<f64>,
    /// Since-start value carried by the `Start` timestamp itself.
    pub start_elapsed: Option<f64>,
    /// Whether any timestamp other than `Start` was seen.
    pub later_timestamps: bool,
    pub ttfb: Option<f64>,
    pub acct: Option<ByteCounts>,
    pub length: Option<u64>,
    pub req_headers: BTreeMap<String, Value>,
    pub resp_headers: BTreeMap<String, Value>,
    pub obj_headers: BTreeMap<String, Value>,
    pub hit: Option<HitInfo>,
    pub vcl_calls: Vec<String>,
    pub fetch_error: Option<String>,
    /// Child vxids announced by `Link` records.
    pub links: Vec<u32>,
    /// Backend fetches folded into this transaction.
    pub backends: Vec<BackendSummary>,
    pub(crate) last_update: Instant,
}

impl Transaction {
    fn empty(vxid: u32, kind: TransactionKind, now: Instant) -> Self {
        Self {
            vxid,
            kind,
            parent_vxid: None,
            subtype: None,
            degraded: false,
            method: None,
            url: None,
            protocol: None,
            status: None,
            client: None,
            started_at: None,
            ended_at: None,
            elapsed: None,
            start_elapsed: None,
            later_timestamps: false,
            ttfb: None,
            acct: None,
            length: None,
            req_headers: BTreeMap::new(),
            resp_headers: BTreeMap::new(),
            obj_headers: BTreeMap::new(),
            hit: None,
            vcl_calls: Vec::new(),
            fetch_error: None,
            links: Vec::new(),
            backends: Vec::new(),
            last_update: now,
        }
    }

    /// Open a transaction from its `Begin` record.
    #[must_use]
    pub fn begin(record: &RawRecord, now: Instant) -> Self {
        let mut transaction = Self::empty(record.vxid, kind_of(record.marker), now);
        match parse_vxid_ref(&record.payload_str()) {
            Some(begin) => {
                if begin.kind == "bereq" {
                    transaction.kind = TransactionKind::Backend;
                }
                transaction.parent_vxid = Some(begin.vxid).filter(|&vxid| vxid != 0);
                transaction.subtype = Some(begin.reason).filter(|reason| !reason.is_empty());
            }
            None => {
                trace!("ASSEMBLER | Unparsable Begin for vxid {}", record.vxid);
            }
        }
        transaction
    }

    /// Open a placeholder for records whose `Begin` was never seen.
    #[must_use]
    pub fn placeholder(record: &RawRecord, now: Instant) -> Self {
        let mut transaction = Self::empty(record.vxid, kind_of(record.marker), now);
        transaction.degraded = true;
        transaction
    }

    /// Merge one field record.
    pub fn apply(&mut self, record: &RawRecord, filter: &HeaderFilter, now: Instant) {
        self.last_update = now;
        let payload = record.payload_str();
        let data = &*payload;

        match record.tag {
            Tag::ReqStart => self.client = parse_req_start(data),
            Tag::ReqMethod | Tag::BereqMethod => self.method = Some(data.to_string()),
            Tag::ReqUrl | Tag::BereqUrl => self.url = Some(data.to_string()),
            Tag::ReqProtocol => self.protocol = Some(data.to_string()),
            Tag::RespStatus | Tag::BerespStatus => {
                self.status = data.trim().parse::<u16>().ok();
            }
            Tag::ReqHeader | Tag::BereqHeader => {
                capture_header(&mut self.req_headers, &filter.req, data);
            }
            Tag::RespHeader | Tag::BerespHeader => {
                capture_header(&mut self.resp_headers, &filter.resp, data);
            }
            Tag::ObjHeader => capture_header(&mut self.obj_headers, &filter.obj, data),
            Tag::Timestamp => self.apply_timestamp(data),
            Tag::ReqAcct | Tag::BereqAcct => {
                if let Some(counts) = parse_acct(data) {
                    self.acct = Some(counts);
                }
            }
            Tag::Link => {
                if let Some(link) = parse_vxid_ref(data) {
                    self.links.push(link.vxid);
                }
            }
            Tag::Hit => self.hit = Some(parse_hit(data)),
            Tag::Length => self.length = data.trim().parse::<u64>().ok(),
            Tag::VclCall => self.vcl_calls.push(data.to_string()),
            Tag::FetchError => self.fetch_error = Some(data.to_string()),
            Tag::Begin | Tag::End => {}
        }
    }

    fn apply_timestamp(&mut self, data: &str) {
        let Some(ts) = parse_timestamp(data) else {
            trace!("ASSEMBLER | Unparsable Timestamp for vxid {}: {data}", self.vxid);
            return;
        };
        if ts.label == "Start" {
            self.started_at = Some(ts.absolute);
            self.start_elapsed = Some(ts.since_start);
            return;
        }
        self.later_timestamps = true;
        match ts.label.as_str() {
            "Process" if self.kind == TransactionKind::Client => {
                self.ttfb = Some(ts.since_start);
            }
            "Beresp" if self.kind == TransactionKind::Backend => {
                self.ttfb = Some(ts.since_start);
            }
            label if END_LABELS.contains(&label) => {
                self.ended_at = Some(ts.absolute);
                self.elapsed = Some(ts.since_start);
            }
            _ => {}
        }
    }

    /// End minus start in seconds, falling back to the since-start value of
    /// the closing timestamp. A transaction whose only timestamp is `Start`
    /// reports that timestamp's since-start value.
    #[must_use]
    pub fn duration(&self) -> Option<f64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ if !self.later_timestamps => self.elapsed.or(self.start_elapsed),
            _ => self.elapsed,
        }
    }

    /// Bytes moved: sent to the client, or received from the backend.
    #[must_use]
    pub fn bytes(&self) -> Option<u64> {
        let from_acct = self.acct.map(|acct| match self.kind {
            TransactionKind::Client => acct.total_tx,
            TransactionKind::Backend => acct.total_rx,
        });
        from_acct.or(self.length)
    }

    #[must_use]
    pub fn summary(&self) -> BackendSummary {
        BackendSummary {
            vxid: self.vxid,
            subtype: self.subtype.clone(),
            method: self.method.clone(),
            url: self.url.clone(),
            status: self.status,
            duration_ms: self.duration().map(seconds_to_ms),
            ttfb_ms: self.ttfb.map(seconds_to_ms),
            bytes: self.bytes(),
            fetch_error: self.fetch_error.clone(),
            incomplete: self.degraded,
        }
    }
}

/// A transaction that left the open set and is ready for mapping.
#[derive(Debug, Clone)]
pub struct CompletedTransaction {
    pub transaction: Transaction,
    pub closure: Closure,
}

impl CompletedTransaction {
    /// Whether the event must carry the `incomplete` marker.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.transaction.degraded || self.closure != Closure::End
    }
}

pub(crate) fn seconds_to_ms(seconds: f64) -> f64 {
    seconds * 1000.0
}

fn kind_of(marker: Marker) -> TransactionKind {
    match marker {
        Marker::Backend => TransactionKind::Backend,
        Marker::Client | Marker::Session => TransactionKind::Client,
    }
}

fn capture_header(
    headers: &mut BTreeMap<String, Value>,
    allowed: &HashSet<String, FnvBuildHasher>,
    data: &str,
) {
    let (name, value) = parse_header(data);
    if !HeaderFilter::allows(allowed, &name) {
        return;
    }
    let value = if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
        value
            .trim()
            .parse::<u64>()
            .map_or(Value::String(value), Value::from)
    } else {
        Value::String(value)
    };
    headers.insert(name, value);
}
