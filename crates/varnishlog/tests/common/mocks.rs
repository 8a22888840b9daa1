// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock publish sinks

use std::collections::VecDeque;
use std::sync::Mutex;

use varnishlog::{Event, PublishSink, Verdict};

/// Sink that acknowledges and keeps every event
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl PublishSink for RecordingSink {
    async fn publish(&self, event: &Event) -> Verdict {
        self.events.lock().unwrap().push(event.clone());
        Verdict::Ack
    }
}

/// Sink that answers from a script, then acknowledges. Only acknowledged
/// events are kept.
pub struct ScriptedSink {
    script: Mutex<VecDeque<Verdict>>,
    attempts: Mutex<u32>,
    delivered: Mutex<Vec<Event>>,
}

impl ScriptedSink {
    pub fn new(script: impl IntoIterator<Item = Verdict>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            attempts: Mutex::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap()
    }

    pub fn delivered(&self) -> Vec<Event> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PublishSink for ScriptedSink {
    async fn publish(&self, event: &Event) -> Verdict {
        *self.attempts.lock().unwrap() += 1;
        let verdict = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Verdict::Ack);
        if verdict == Verdict::Ack {
            self.delivered.lock().unwrap().push(event.clone());
        }
        verdict
    }
}
