//! Notification events emitted by the image service. Delivery is
//! fire-and-forget: a slow or broken sink must never stall a transfer.

use async_trait::async_trait;
use serde::{
    Deserialize,
    Serialize,
};

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSendFields {
    /// Bytes actually written to the client, whether or not the transfer
    /// finished.
    pub bytes_sent: u64,
    pub image_id: String,
    /// Tenant owning the image, if any.
    pub owner_id: Option<String>,
    /// Tenant the bytes were sent to.
    pub receiver_tenant_id: Option<String>,
    /// User the bytes were sent to.
    pub receiver_user_id: Option<String>,
    pub destination_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageEvent {
    /// A download completed.
    #[serde(rename = "image.send")]
    Send {
        #[serde(flatten)]
        fields: ImageSendFields,
    },
    /// A download ended early or failed; `bytes_sent` reflects what actually
    /// went out.
    #[serde(rename = "image.send.error")]
    SendError {
        #[serde(flatten)]
        fields: ImageSendFields,
    },
}

#[async_trait]
pub trait EventLogger: Send + Sync + std::fmt::Debug {
    /// A close to zero cost log method that dumps events into a buffer
    ///
    /// Implementations may choose to drop records on the floor if buffers are
    /// unexpectedly full. If you can accept the penalty for waiting for the
    /// buffer to empty out, use record_async instead.
    fn record(&self, events: Vec<ImageEvent>);

    /// Dump events into a buffer, waiting for the buffer to empty if it's
    /// full.
    async fn record_async(&self, events: Vec<ImageEvent>);

    /// Cleanly shutdown, flushing events
    async fn shutdown(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct NoOpEventLogger;

#[async_trait]
impl EventLogger for NoOpEventLogger {
    fn record(&self, _events: Vec<ImageEvent>) {}

    async fn record_async(&self, _events: Vec<ImageEvent>) {}

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes events to the structured log. The default sink for deployments
/// without an external notification bus.
#[derive(Debug, Clone)]
pub struct TracingEventLogger;

#[async_trait]
impl EventLogger for TracingEventLogger {
    fn record(&self, events: Vec<ImageEvent>) {
        for event in events {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(target: "events", "{json}"),
                Err(e) => tracing::warn!("Dropping unserializable event: {e}"),
            }
        }
    }

    async fn record_async(&self, events: Vec<ImageEvent>) {
        self.record(events)
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        ImageEvent,
        ImageSendFields,
    };

    #[test]
    fn test_send_event_shape() -> anyhow::Result<()> {
        let event = ImageEvent::Send {
            fields: ImageSendFields {
                bytes_sent: 19,
                image_id: "71c675ab".to_owned(),
                owner_id: Some("pattieblack".to_owned()),
                receiver_tenant_id: Some("froggy".to_owned()),
                receiver_user_id: Some("joe".to_owned()),
                destination_ip: Some("10.0.0.2".to_owned()),
            },
        };
        let value = serde_json::to_value(&event)?;
        assert_eq!(
            value,
            json!({
                "image.send": {
                    "bytes_sent": 19,
                    "image_id": "71c675ab",
                    "owner_id": "pattieblack",
                    "receiver_tenant_id": "froggy",
                    "receiver_user_id": "joe",
                    "destination_ip": "10.0.0.2",
                }
            })
        );
        Ok(())
    }
}
