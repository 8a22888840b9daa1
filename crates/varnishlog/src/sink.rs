// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{DropReason, PublishFailure};
use crate::mapper::Event;

/// Sink answer for one publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Delivered; the pipeline forgets the event.
    Ack,
    /// Transient failure; the same event is offered again.
    Retry,
    /// Permanent refusal.
    Drop,
}

/// Boundary to whatever transports events off-process.
#[async_trait]
pub trait PublishSink: Send + Sync {
    /// Offer one event. The pipeline keeps ownership until `Ack` or `Drop`,
    /// so a `Retry` re-offers the same event.
    async fn publish(&self, event: &Event) -> Verdict;
}

#[async_trait]
impl<S: PublishSink + ?Sized> PublishSink for Arc<S> {
    async fn publish(&self, event: &Event) -> Verdict {
        (**self).publish(event).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Re-attempts after the first `Retry`.
    pub max_retries: u32,
    /// Wait before re-attempt `n` is `backoff * n`.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Wait before re-attempt `attempt`, saturating instead of overflowing.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.publish_max_retries,
            backoff: config.publish_retry_backoff,
        }
    }
}

/// Publish `event`, re-offering it on `Retry` until the policy runs out.
///
/// Returns the number of attempts it took on `Ack`.
pub async fn publish_with_retry<S: PublishSink + ?Sized>(
    sink: &S,
    event: &Event,
    policy: &RetryPolicy,
) -> Result<u32, PublishFailure> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match sink.publish(event).await {
            Verdict::Ack => return Ok(attempts),
            Verdict::Drop => {
                return Err(PublishFailure {
                    vxid: event.vxid,
                    attempts,
                    reason: DropReason::Rejected,
                })
            }
            Verdict::Retry if attempts > policy.max_retries => {
                return Err(PublishFailure {
                    vxid: event.vxid,
                    attempts,
                    reason: DropReason::RetriesExhausted,
                })
            }
            Verdict::Retry => {
                let wait = policy.delay(attempts);
                debug!(
                    "PUBLISH | Sink asked to retry vxid {} (attempt {attempts}), waiting {} ms",
                    event.vxid,
                    wait.as_millis()
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Publish and log the outcome. Returns whether the sink acknowledged.
pub async fn publish_and_log<S: PublishSink + ?Sized>(
    sink: &S,
    event: &Event,
    policy: &RetryPolicy,
) -> bool {
    match publish_with_retry(sink, event, policy).await {
        Ok(_) => true,
        Err(failure) => {
            warn!("PUBLISH | {failure}");
            false
        }
    }
}
