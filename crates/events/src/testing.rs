use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    EventLogger,
    ImageEvent,
};

/// Collects events in memory so tests can assert on exactly what was
/// emitted.
#[derive(Debug, Clone)]
pub struct TestEventLogger {
    events: Arc<Mutex<Vec<ImageEvent>>>,
}

impl TestEventLogger {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn collect(&self) -> Vec<ImageEvent> {
        std::mem::take(&mut self.events.lock())
    }
}

#[async_trait]
impl EventLogger for TestEventLogger {
    fn record(&self, events: Vec<ImageEvent>) {
        self.events.lock().extend(events);
    }

    async fn record_async(&self, events: Vec<ImageEvent>) {
        self.record(events)
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
