// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsers for the text payloads of individual record tags.
//!
//! Formats follow `varnishlog` output. Parsers are lenient: a malformed
//! payload yields `None` (or zeroed fields) and the caller keeps going.

use std::net::IpAddr;

use serde::Serialize;

/// Value stored for a header whose `": "` separator was cut off.
pub const TRUNCATED_HEADER_VALUE: &str = "truncated";

/// `Begin` and `Link` payload: `<type> <vxid> <reason>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxidRef {
    /// `req`, `bereq` or `sess`.
    pub kind: String,
    pub vxid: u32,
    pub reason: String,
}

pub fn parse_vxid_ref(data: &str) -> Option<VxidRef> {
    let mut parts = data.splitn(3, ' ');
    let kind = parts.next()?.to_string();
    let vxid = parts.next()?.trim().parse::<u32>().ok()?;
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Some(VxidRef { kind, vxid, reason })
}

/// `Timestamp` payload: `<label>: <absolute> <since_start> <since_last>`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampEntry {
    pub label: String,
    /// Seconds since the Unix epoch.
    pub absolute: f64,
    /// Seconds since the transaction started.
    pub since_start: f64,
    /// Seconds since the previous timestamp.
    pub since_last: f64,
}

pub fn parse_timestamp(data: &str) -> Option<TimestampEntry> {
    let (label, rest) = data.split_once(": ")?;
    let mut values = rest.split_whitespace().map(str::parse::<f64>);
    let absolute = values.next()?.ok()?;
    let since_start = values.next()?.ok()?;
    let since_last = values.next()?.ok()?;
    Some(TimestampEntry {
        label: label.to_string(),
        absolute,
        since_start,
        since_last,
    })
}

/// `ReqAcct` / `BereqAcct` payload: six byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ByteCounts {
    pub header_rx: u64,
    pub body_rx: u64,
    pub total_rx: u64,
    pub header_tx: u64,
    pub body_tx: u64,
    pub total_tx: u64,
}

pub fn parse_acct(data: &str) -> Option<ByteCounts> {
    let values = data
        .split_whitespace()
        .map(str::parse::<u64>)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    match values.as_slice() {
        [header_rx, body_rx, total_rx, header_tx, body_tx, total_tx] => Some(ByteCounts {
            header_rx: *header_rx,
            body_rx: *body_rx,
            total_rx: *total_rx,
            header_tx: *header_tx,
            body_tx: *body_tx,
            total_tx: *total_tx,
        }),
        _ => None,
    }
}

/// `Hit` payload: `<objvxid> [ttl [grace [keep]]]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HitInfo {
    pub obj_vxid: u32,
    pub remaining_ttl: f64,
    pub grace_period: f64,
    pub keep_period: f64,
}

/// Missing or unparsable fields stay zero.
#[must_use]
pub fn parse_hit(data: &str) -> HitInfo {
    let mut parts = data.split_whitespace();
    let obj_vxid = parts
        .next()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or_default();
    let mut next_f64 = || {
        parts
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or_default()
    };
    HitInfo {
        obj_vxid,
        remaining_ttl: next_f64(),
        grace_period: next_f64(),
        keep_period: next_f64(),
    }
}

/// Header payload: `Name: value`.
#[must_use]
pub fn parse_header(data: &str) -> (String, String) {
    match data.split_once(": ") {
        Some((name, value)) => (name.to_string(), value.to_string()),
        None => (data.to_string(), TRUNCATED_HEADER_VALUE.to_string()),
    }
}

/// `ReqStart` payload: `<client ip> <client port> [listener]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddr {
    pub ip: IpAddr,
    pub port: Option<u16>,
    pub listener: Option<String>,
}

pub fn parse_req_start(data: &str) -> Option<ClientAddr> {
    let mut parts = data.split_whitespace();
    let ip = parts.next()?.parse::<IpAddr>().ok()?;
    let port = parts.next().and_then(|p| p.parse::<u16>().ok());
    let listener = parts.next().map(str::to_string);
    Some(ClientAddr { ip, port, listener })
}
