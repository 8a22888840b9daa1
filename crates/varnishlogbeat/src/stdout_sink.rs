// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Console output: one JSON object per line.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::Mutex;
use tracing::{debug, error};
use varnishlog::{Event, PublishSink, Verdict};

pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

pub type StdoutSink = JsonLinesSink<Stdout>;

impl StdoutSink {
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> PublishSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn publish(&self, event: &Event) -> Verdict {
        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(e) => {
                error!("STDOUT | Failed to serialize event for vxid {}: {e}", event.vxid);
                return Verdict::Drop;
            }
        };
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;
        match written {
            Ok(()) => Verdict::Ack,
            Err(e) => {
                debug!("STDOUT | Write failed for vxid {}: {e}", event.vxid);
                Verdict::Retry
            }
        }
    }
}
