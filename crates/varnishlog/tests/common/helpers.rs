// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::path::Path;
use std::time::Duration;

use tokio::time::timeout;
use varnishlog::config::Config;
use varnishlog::decoder::{Marker, Tag};
use varnishlog::segment::writer::SegmentWriter;
use varnishlog::{PipelineHandle, PipelineStatus};

pub const SLOT_SIZE: u32 = 128;

/// Config with a short poll interval pointing at `path`
pub fn test_config(path: &Path) -> Config {
    Config {
        path: path.display().to_string(),
        poll_interval: Duration::from_millis(5),
        publish_retry_backoff: Duration::from_millis(1),
        ..Config::default()
    }
}

/// Write a complete client request
pub fn write_client_request(
    writer: &mut SegmentWriter,
    vxid: u32,
    method: &str,
    url: &str,
    status: u16,
    bytes: u64,
) {
    let records = [
        (Tag::Begin, "req 1 rxreq".to_string()),
        (Tag::ReqMethod, method.to_string()),
        (Tag::ReqUrl, url.to_string()),
        (Tag::RespStatus, status.to_string()),
        (Tag::Length, bytes.to_string()),
        (Tag::End, String::new()),
    ];
    for (tag, payload) in records {
        writer
            .append(Marker::Client, tag, vxid, payload.as_bytes())
            .expect("Failed to append record");
    }
}

/// Wait until the pipeline reports `Running`
pub async fn wait_running(handle: &PipelineHandle) {
    let mut status = handle.status_receiver();
    timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == PipelineStatus::Running),
    )
    .await
    .expect("Pipeline did not start in time")
    .expect("Status channel closed");
}

/// Poll `check` until it holds or five seconds pass
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let result = timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Condition not reached in time");
}
