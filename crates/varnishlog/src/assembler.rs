// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction assembler.
//!
//! Groups decoded records by vxid. Client transactions complete into
//! [`CompletedTransaction`]s; backend transactions fold into their client
//! parent while it is still open.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use fnv::FnvBuildHasher;
use hashbrown::{HashMap, HashSet};
use tracing::{debug, trace};

use crate::config::{Config, IncludeHeaders};
use crate::decoder::{Marker, RawRecord, Tag};
use crate::transaction::{
    Closure, CompletedTransaction, HeaderFilter, Transaction, TransactionKind,
};

/// How many closed vxids are remembered to make late `End` records no-ops.
pub const RECENTLY_CLOSED_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub inactivity_timeout: Duration,
    pub log_backend_traffic: bool,
    pub include_headers: IncludeHeaders,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        AssemblerConfig::from(&Config::default())
    }
}

impl From<&Config> for AssemblerConfig {
    fn from(config: &Config) -> Self {
        Self {
            inactivity_timeout: config.inactivity_timeout,
            log_backend_traffic: config.log_backend_traffic,
            include_headers: config.include_headers.clone(),
        }
    }
}

// Bounded set of vxids that completed recently, oldest first.
#[derive(Debug)]
struct RecentlyClosed {
    order: VecDeque<u32>,
    members: HashSet<u32, FnvBuildHasher>,
    capacity: usize,
}

impl RecentlyClosed {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity_and_hasher(capacity, FnvBuildHasher::default()),
            capacity,
        }
    }

    fn insert(&mut self, vxid: u32) {
        if !self.members.insert(vxid) {
            return;
        }
        self.order.push_back(vxid);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn contains(&self, vxid: u32) -> bool {
        self.members.contains(&vxid)
    }

    // vxids wrap, so a fresh Begin may reuse a remembered id.
    fn forget(&mut self, vxid: u32) {
        if self.members.remove(&vxid) {
            self.order.retain(|&id| id != vxid);
        }
    }
}

pub struct Assembler {
    config: AssemblerConfig,
    filter: HeaderFilter,
    open: HashMap<u32, Transaction, FnvBuildHasher>,
    closed: RecentlyClosed,
}

impl Assembler {
    #[must_use]
    pub fn new(config: AssemblerConfig) -> Self {
        let filter = HeaderFilter::new(&config.include_headers);
        Self {
            config,
            filter,
            open: HashMap::default(),
            closed: RecentlyClosed::new(RECENTLY_CLOSED_CAPACITY),
        }
    }

    /// Number of open transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Feed one record; returns whatever it completed.
    pub fn feed(&mut self, record: &RawRecord, now: Instant) -> Vec<CompletedTransaction> {
        let mut completed = Vec::new();

        if record.marker == Marker::Session {
            trace!("ASSEMBLER | Skipping session record {} for vxid {}", record.tag, record.vxid);
            return completed;
        }

        match record.tag {
            Tag::Begin => {
                if let Some(mut stale) = self.open.remove(&record.vxid) {
                    debug!(
                        "ASSEMBLER | Begin for open vxid {}, closing the previous one as incomplete",
                        record.vxid
                    );
                    stale.degraded = true;
                    self.complete(stale, Closure::Superseded, &mut completed);
                }
                self.closed.forget(record.vxid);
                self.open.insert(record.vxid, Transaction::begin(record, now));
            }
            Tag::End => match self.open.remove(&record.vxid) {
                Some(mut transaction) => {
                    transaction.last_update = now;
                    self.complete(transaction, Closure::End, &mut completed);
                }
                None if self.closed.contains(record.vxid) => {
                    trace!("ASSEMBLER | Duplicate End for vxid {}", record.vxid);
                }
                None => {
                    debug!("ASSEMBLER | End for unknown vxid {}, ignoring", record.vxid);
                }
            },
            _ => {
                if self.closed.contains(record.vxid) && !self.open.contains_key(&record.vxid) {
                    trace!(
                        "ASSEMBLER | Late {} record for closed vxid {}, ignoring",
                        record.tag,
                        record.vxid
                    );
                    return completed;
                }
                let filter = &self.filter;
                self.open
                    .entry(record.vxid)
                    .or_insert_with(|| {
                        debug!(
                            "ASSEMBLER | {} record for vxid {} without Begin, tracking as incomplete",
                            record.tag, record.vxid
                        );
                        Transaction::placeholder(record, now)
                    })
                    .apply(record, filter, now);
            }
        }

        completed
    }

    /// Evict transactions idle for longer than the inactivity timeout.
    ///
    /// Evicted transactions complete as incomplete through the same path as
    /// an `End`, so each is emitted at most once.
    pub fn sweep(&mut self, now: Instant) -> Vec<CompletedTransaction> {
        let timeout = self.config.inactivity_timeout;
        let mut stale: Vec<(TransactionKind, u32)> = self
            .open
            .values()
            .filter(|tx| now.saturating_duration_since(tx.last_update) > timeout)
            .map(|tx| (tx.kind, tx.vxid))
            .collect();
        if stale.is_empty() {
            return Vec::new();
        }

        // Backends first so they can still fold into a parent evicted in the
        // same sweep.
        stale.sort_by_key(|&(kind, vxid)| (kind == TransactionKind::Client, vxid));

        let mut completed = Vec::new();
        for (_, vxid) in stale {
            if let Some(mut transaction) = self.open.remove(&vxid) {
                debug!("ASSEMBLER | Evicting idle vxid {vxid}");
                transaction.degraded = true;
                self.complete(transaction, Closure::Evicted, &mut completed);
            }
        }
        completed
    }

    /// Drop every open transaction without emitting it.
    pub fn discard_in_flight(&mut self) -> usize {
        let discarded = self.open.len();
        for vxid in self.open.keys() {
            self.closed.insert(*vxid);
        }
        self.open.clear();
        discarded
    }

    fn complete(
        &mut self,
        transaction: Transaction,
        closure: Closure,
        completed: &mut Vec<CompletedTransaction>,
    ) {
        self.closed.insert(transaction.vxid);

        if transaction.kind == TransactionKind::Backend {
            let parent = transaction
                .parent_vxid
                .and_then(|parent| self.open.get_mut(&parent));
            if let Some(parent) = parent {
                trace!(
                    "ASSEMBLER | Folding backend vxid {} into vxid {}",
                    transaction.vxid,
                    parent.vxid
                );
                parent.backends.push(transaction.summary());
                return;
            }
            if !self.config.log_backend_traffic {
                debug!(
                    "ASSEMBLER | Dropping backend vxid {} without open parent",
                    transaction.vxid
                );
                return;
            }
        }

        completed.push(CompletedTransaction {
            transaction,
            closure,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rec(marker: Marker, tag: Tag, vxid: u32, payload: &str) -> RawRecord {
        RawRecord::new(marker, tag, vxid, payload)
    }

    fn req(tag: Tag, vxid: u32, payload: &str) -> RawRecord {
        rec(Marker::Client, tag, vxid, payload)
    }

    fn bereq(tag: Tag, vxid: u32, payload: &str) -> RawRecord {
        rec(Marker::Backend, tag, vxid, payload)
    }

    fn feed_all(
        assembler: &mut Assembler,
        records: &[RawRecord],
        now: Instant,
    ) -> Vec<CompletedTransaction> {
        records
            .iter()
            .flat_map(|record| assembler.feed(record, now))
            .collect()
    }

    #[test]
    fn test_single_transaction_completes_once() {
        let mut assembler = Assembler::new(AssemblerConfig::default());
        let now = Instant::now();
        let done = feed_all(
            &mut assembler,
            &[
                req(Tag::Begin, 1, "req 0 rxreq"),
                req(Tag::ReqMethod, 1, "GET"),
                req(Tag::ReqUrl, 1, "/"),
                req(Tag::RespStatus, 1, "200"),
                req(Tag::Length, 1, "512"),
                req(Tag::End, 1, ""),
            ],
            now,
        );

        assert_eq!(done.len(), 1);
        let tx = &done[0].transaction;
        assert_eq!(tx.method.as_deref(), Some("GET"));
        assert_eq!(tx.url.as_deref(), Some("/"));
        assert_eq!(tx.status, Some(200));
        assert_eq!(tx.bytes(), Some(512));
        assert!(!done[0].is_incomplete());
        assert!(assembler.is_empty());

        assert!(assembler.feed(&req(Tag::End, 1, ""), now).is_empty());
        assert!(assembler.feed(&req(Tag::RespStatus, 1, "500"), now).is_empty());
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_interleaved_transactions() {
        let mut assembler = Assembler::new(AssemblerConfig::default());
        let now = Instant::now();
        let done = feed_all(
            &mut assembler,
            &[
                req(Tag::Begin, 1, "req 0 rxreq"),
                req(Tag::Begin, 2, "req 0 rxreq"),
                req(Tag::ReqUrl, 2, "/two"),
                req(Tag::ReqUrl, 1, "/one"),
                req(Tag::End, 2, ""),
                req(Tag::End, 1, ""),
            ],
            now,
        );
        let urls: Vec<_> = done
            .iter()
            .map(|c| c.transaction.url.clone().unwrap())
            .collect();
        assert_eq!(urls, vec!["/two", "/one"]);
    }

    #[test]
    fn test_missing_begin_yields_degraded() {
        let mut assembler = Assembler::new(AssemblerConfig::default());
        let now = Instant::now();
        let done = feed_all(
            &mut assembler,
            &[req(Tag::ReqUrl, 7, "/late"), req(Tag::End, 7, "")],
            now,
        );
        assert_eq!(done.len(), 1);
        assert!(done[0].transaction.degraded);
        assert!(done[0].is_incomplete());
    }

    #[test]
    fn test_begin_for_open_vxid_supersedes() {
        let mut assembler = Assembler::new(AssemblerConfig::default());
        let now = Instant::now();
        let done = feed_all(
            &mut assembler,
            &[
                req(Tag::Begin, 3, "req 0 rxreq"),
                req(Tag::ReqUrl, 3, "/first"),
                req(Tag::Begin, 3, "req 0 rxreq"),
            ],
            now,
        );
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].closure, Closure::Superseded);
        assert!(done[0].is_incomplete());
        assert_eq!(assembler.len(), 1);
    }

    #[test]
    fn test_backend_folds_into_open_parent() {
        let mut assembler = Assembler::new(AssemblerConfig::default());
        let now = Instant::now();
        let done = feed_all(
            &mut assembler,
            &[
                req(Tag::Begin, 10, "req 1 rxreq"),
                req(Tag::Link, 10, "bereq 11 fetch"),
                bereq(Tag::Begin, 11, "bereq 10 fetch"),
                bereq(Tag::BereqUrl, 11, "/origin"),
                bereq(Tag::BerespStatus, 11, "200"),
                bereq(Tag::BereqAcct, 11, "100 0 100 300 1000 1300"),
                bereq(Tag::End, 11, ""),
            ],
            now,
        );
        assert!(done.is_empty());

        let done = assembler.feed(&req(Tag::End, 10, ""), now);
        assert_eq!(done.len(), 1);
        let parent = &done[0].transaction;
        assert_eq!(parent.links, vec![11]);
        assert_eq!(parent.backends.len(), 1);
        assert_eq!(parent.backends[0].vxid, 11);
        assert_eq!(parent.backends[0].url.as_deref(), Some("/origin"));
        assert_eq!(parent.backends[0].bytes, Some(100));
    }

    #[test]
    fn test_orphan_backend_respects_log_backend_traffic() {
        let records = [
            bereq(Tag::Begin, 21, "bereq 20 bgfetch"),
            bereq(Tag::BereqUrl, 21, "/refresh"),
            bereq(Tag::End, 21, ""),
        ];
        let now = Instant::now();

        let mut logging = Assembler::new(AssemblerConfig::default());
        let done = feed_all(&mut logging, &records, now);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].transaction.kind, TransactionKind::Backend);

        let mut quiet = Assembler::new(AssemblerConfig {
            log_backend_traffic: false,
            ..AssemblerConfig::default()
        });
        assert!(feed_all(&mut quiet, &records, now).is_empty());
        assert!(quiet.is_empty());
    }

    #[test]
    fn test_sweep_evicts_once() {
        let mut assembler = Assembler::new(AssemblerConfig {
            inactivity_timeout: Duration::from_secs(5),
            ..AssemblerConfig::default()
        });
        let start = Instant::now();
        feed_all(
            &mut assembler,
            &[req(Tag::Begin, 30, "req 0 rxreq"), req(Tag::ReqUrl, 30, "/slow")],
            start,
        );
        feed_all(
            &mut assembler,
            &[req(Tag::Begin, 31, "req 0 rxreq")],
            start + Duration::from_secs(4),
        );

        assert!(assembler.sweep(start + Duration::from_secs(5)).is_empty());

        let evicted = assembler.sweep(start + Duration::from_secs(6));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].transaction.vxid, 30);
        assert_eq!(evicted[0].closure, Closure::Evicted);
        assert!(evicted[0].is_incomplete());

        assert!(assembler.sweep(start + Duration::from_secs(7)).is_empty());
        assert!(assembler
            .feed(&req(Tag::End, 30, ""), start + Duration::from_secs(7))
            .is_empty());
        assert_eq!(assembler.len(), 1);
    }

    #[test]
    fn test_sweep_folds_stale_backend_into_stale_parent() {
        let mut assembler = Assembler::new(AssemblerConfig {
            inactivity_timeout: Duration::from_secs(1),
            ..AssemblerConfig::default()
        });
        let start = Instant::now();
        feed_all(
            &mut assembler,
            &[
                req(Tag::Begin, 40, "req 0 rxreq"),
                bereq(Tag::Begin, 41, "bereq 40 fetch"),
            ],
            start,
        );
        let evicted = assembler.sweep(start + Duration::from_secs(2));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].transaction.vxid, 40);
        assert_eq!(evicted[0].transaction.backends.len(), 1);
        assert!(evicted[0].transaction.backends[0].incomplete);
    }

    #[test]
    fn test_discard_in_flight() {
        let mut assembler = Assembler::new(AssemblerConfig::default());
        let now = Instant::now();
        feed_all(
            &mut assembler,
            &[req(Tag::Begin, 50, "req 0 rxreq"), req(Tag::Begin, 51, "req 0 rxreq")],
            now,
        );
        assert_eq!(assembler.discard_in_flight(), 2);
        assert!(assembler.is_empty());
        assert!(assembler.feed(&req(Tag::End, 50, ""), now).is_empty());
    }

    #[test]
    fn test_session_records_are_skipped() {
        let mut assembler = Assembler::new(AssemblerConfig::default());
        let now = Instant::now();
        let done = feed_all(
            &mut assembler,
            &[
                rec(Marker::Session, Tag::Begin, 1, "sess 0 HTTP/1"),
                rec(Marker::Session, Tag::End, 1, ""),
            ],
            now,
        );
        assert!(done.is_empty());
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_recently_closed_is_bounded() {
        let mut closed = RecentlyClosed::new(2);
        closed.insert(1);
        closed.insert(2);
        closed.insert(3);
        assert!(!closed.contains(1));
        assert!(closed.contains(3));
        closed.forget(3);
        assert!(!closed.contains(3));
        closed.insert(4);
        closed.insert(5);
        assert!(!closed.contains(2));
    }
}
