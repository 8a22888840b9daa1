// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline controller.
//!
//! Owns the segment cursor and drives decode, assemble, map and publish one
//! slot at a time. Lifecycle:
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!                           |                      ^
//!                           +---- fatal error -----+
//! ```

use std::time::Instant;

use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assembler::{Assembler, AssemblerConfig};
use crate::config::Config;
use crate::decoder::{decode, Decoded};
use crate::errors::{AttachError, PipelineError, SegmentError};
use crate::mapper::map;
use crate::segment::{Cursor, LogSegment, SharedMemory};
use crate::sink::{publish_and_log, PublishSink, RetryPolicy};
use crate::transaction::CompletedTransaction;

pub const RUNNING_MESSAGE: &str = "varnishlogbeat is running! Hit CTRL-C to stop it.";

// Upper bound on the wait between attach attempts.
const ATTACH_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Counters reported when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub records_read: u64,
    pub decode_errors: u64,
    pub events_published: u64,
    pub events_dropped: u64,
    /// Open transactions thrown away on overrun, reset or stop.
    pub transactions_discarded: u64,
    pub overruns: u64,
    pub resets: u64,
}

/// Handle to a controller: observe its status and ask it to stop.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    status_rx: watch::Receiver<PipelineStatus>,
    cancel: CancellationToken,
}

impl PipelineHandle {
    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        *self.status_rx.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status() == PipelineStatus::Running
    }

    /// Receiver for status updates.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<PipelineStatus> {
        self.status_rx.clone()
    }

    /// Request a stop. The tick in progress finishes and its events are
    /// published before the run returns.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

enum SegmentSource {
    Path(String),
    Memory(SharedMemory),
}

impl SegmentSource {
    fn attach(&self) -> Result<LogSegment, AttachError> {
        match self {
            SegmentSource::Path(pattern) => LogSegment::attach(pattern),
            SegmentSource::Memory(memory) => LogSegment::attach_memory(memory.clone()),
        }
    }
}

/// What one read step produced.
#[derive(Debug)]
pub(crate) enum Step {
    /// A record was consumed; these transactions completed.
    Completed(Vec<CompletedTransaction>),
    /// Nothing new to read.
    Idle,
}

// Segment, cursor and assembler for one run.
pub(crate) struct Reader {
    segment: LogSegment,
    cursor: Cursor,
    assembler: Assembler,
    summary: PipelineSummary,
}

impl Reader {
    pub(crate) fn new(
        segment: LogSegment,
        read_from_start: bool,
        config: AssemblerConfig,
    ) -> Result<Self, SegmentError> {
        let cursor = if read_from_start {
            segment.oldest()?
        } else {
            segment.tail()?
        };
        Ok(Self {
            segment,
            cursor,
            assembler: Assembler::new(config),
            summary: PipelineSummary::default(),
        })
    }

    /// Read and process at most one slot.
    ///
    /// Overruns and writer resets are absorbed here: in-flight transactions
    /// are discarded and the cursor resynchronises. Any other segment error
    /// is returned and ends the run.
    pub(crate) fn step(&mut self, now: Instant) -> Result<Step, SegmentError> {
        let slot = match self.segment.read_slot(&self.cursor) {
            Ok(Some(slot)) => slot,
            Ok(None) => return Ok(Step::Idle),
            Err(SegmentError::Overwritten { lost }) => {
                let discarded = self.discard();
                warn!(
                    "PIPELINE | Reader overrun: {lost} records lost, discarded {discarded} in-flight transactions"
                );
                self.summary.overruns += 1;
                self.cursor = self.segment.oldest()?;
                return Ok(Step::Completed(Vec::new()));
            }
            Err(SegmentError::Reset { old, new }) => {
                let discarded = self.discard();
                warn!(
                    "PIPELINE | Segment reset (epoch {old} -> {new}), discarded {discarded} in-flight transactions"
                );
                self.summary.resets += 1;
                self.cursor = self.segment.tail()?;
                return Ok(Step::Completed(Vec::new()));
            }
            Err(e) => return Err(e),
        };

        match decode(&slot) {
            Ok(Decoded::Record(record)) => {
                self.summary.records_read += 1;
                self.cursor.advance();
                Ok(Step::Completed(self.assembler.feed(&record, now)))
            }
            // Not written yet; stay on this slot.
            Ok(Decoded::EndOfData) => Ok(Step::Idle),
            Err(e) => {
                self.summary.decode_errors += 1;
                warn!(
                    "PIPELINE | Skipping undecodable slot {}: {e}",
                    self.cursor.seq()
                );
                self.cursor.advance();
                Ok(Step::Completed(Vec::new()))
            }
        }
    }

    pub(crate) fn sweep(&mut self, now: Instant) -> Vec<CompletedTransaction> {
        self.assembler.sweep(now)
    }

    pub(crate) fn discard(&mut self) -> usize {
        let discarded = self.assembler.discard_in_flight();
        self.summary.transactions_discarded += discarded as u64;
        discarded
    }

    pub(crate) fn summary(&self) -> PipelineSummary {
        self.summary
    }
}

/// Runs the pipeline against one segment and one sink.
pub struct Controller<S: PublishSink> {
    config: Config,
    sink: S,
    source: SegmentSource,
    status_tx: watch::Sender<PipelineStatus>,
    cancel: CancellationToken,
}

impl<S: PublishSink> Controller<S> {
    /// Controller reading the segment at `config.path`.
    pub fn new(config: Config, sink: S) -> Self {
        let source = SegmentSource::Path(config.path.clone());
        Self::with_source(config, sink, source)
    }

    /// Controller reading an in-process segment.
    pub fn with_memory(config: Config, sink: S, memory: SharedMemory) -> Self {
        Self::with_source(config, sink, SegmentSource::Memory(memory))
    }

    fn with_source(config: Config, sink: S, source: SegmentSource) -> Self {
        let (status_tx, _) = watch::channel(PipelineStatus::Stopped);
        Self {
            config,
            sink,
            source,
            status_tx,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            status_rx: self.status_tx.subscribe(),
            cancel: self.cancel.clone(),
        }
    }

    fn set_status(&self, status: PipelineStatus) {
        self.status_tx.send_replace(status);
    }

    /// Run until stopped or a fatal error.
    ///
    /// Consumes the controller: every run starts with an empty assembler.
    pub async fn run(self) -> Result<PipelineSummary, PipelineError> {
        self.set_status(PipelineStatus::Starting);

        let segment = match self.attach().await {
            Ok(Some(segment)) => segment,
            Ok(None) => {
                debug!("PIPELINE | Stopped before attaching");
                self.set_status(PipelineStatus::Stopped);
                return Ok(PipelineSummary::default());
            }
            Err(e) => {
                error!("PIPELINE | {e}");
                self.set_status(PipelineStatus::Stopped);
                return Err(PipelineError::Attach(e));
            }
        };
        info!(
            "PIPELINE | Attached to {} ({} slots of {} bytes)",
            segment.source(),
            segment.slot_count(),
            segment.slot_size()
        );

        let mut reader = match Reader::new(
            segment,
            self.config.read_from_start,
            AssemblerConfig::from(&self.config),
        ) {
            Ok(reader) => reader,
            Err(e) => return Err(self.fail(e)),
        };

        info!("{RUNNING_MESSAGE}");
        self.set_status(PipelineStatus::Running);

        let policy = RetryPolicy::from(&self.config);
        let mut last_sweep = now();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let step = match reader.step(now()) {
                Ok(step) => step,
                Err(e) => return Err(self.fail(e)),
            };
            match step {
                Step::Completed(completed) => {
                    self.publish(completed, &policy, &mut reader.summary).await;
                }
                Step::Idle => {
                    tokio::select! {
                        () = sleep(self.config.poll_interval) => {}
                        () = self.cancel.cancelled() => {}
                    }
                }
            }

            let tick = now();
            if tick.saturating_duration_since(last_sweep) >= self.config.sweep_interval {
                let evicted = reader.sweep(tick);
                if !evicted.is_empty() {
                    debug!("PIPELINE | Evicted {} idle transactions", evicted.len());
                }
                self.publish(evicted, &policy, &mut reader.summary).await;
                last_sweep = tick;
            }
        }

        self.set_status(PipelineStatus::Stopping);
        let discarded = reader.discard();
        if discarded > 0 {
            info!("PIPELINE | Discarding {discarded} unfinished transactions on stop");
        }
        let summary = reader.summary();
        drop(reader);

        info!(
            "PIPELINE | Stopped: {} records read, {} events published, {} dropped",
            summary.records_read, summary.events_published, summary.events_dropped
        );
        self.set_status(PipelineStatus::Stopped);
        Ok(summary)
    }

    // Retries until the attach timeout elapses. `None` means stopped first.
    async fn attach(&self) -> Result<Option<LogSegment>, AttachError> {
        let deadline = now() + self.config.attach_timeout;
        loop {
            match self.source.attach() {
                Ok(segment) => return Ok(Some(segment)),
                Err(e) if now() < deadline => {
                    debug!("PIPELINE | Attach failed, retrying: {e}");
                    let wait = ATTACH_RETRY_INTERVAL
                        .min(deadline.saturating_duration_since(now()))
                        .max(Duration::from_millis(1));
                    tokio::select! {
                        () = sleep(wait) => {}
                        () = self.cancel.cancelled() => return Ok(None),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn publish(
        &self,
        completed: Vec<CompletedTransaction>,
        policy: &RetryPolicy,
        summary: &mut PipelineSummary,
    ) {
        for transaction in completed {
            let mut event = map(&transaction);
            event.count = summary.events_published + summary.events_dropped + 1;
            if event.incomplete {
                debug!("PIPELINE | Publishing incomplete event for vxid {}", event.vxid);
            }
            if publish_and_log(&self.sink, &event, policy).await {
                summary.events_published += 1;
            } else {
                summary.events_dropped += 1;
            }
        }
    }

    fn fail(&self, e: SegmentError) -> PipelineError {
        error!("PIPELINE | Fatal segment error: {e}");
        self.set_status(PipelineStatus::Stopped);
        PipelineError::Segment(e)
    }
}

// Follows the tokio clock so paused-time tests drive eviction.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
