//! Mock transport for testing.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{
    BusError, ConnectionState, MessageHandler, MessageTransport, Result, SubscriptionSpec,
};

/// A call recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub reply: bool,
    pub subject: String,
    pub payload: Bytes,
}

impl MockCall {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Mock transport that records publishes and can fail on demand.
#[derive(Default)]
pub struct MockTransport {
    published: RwLock<Vec<MockCall>>,
    fail_on_publish: RwLock<bool>,
    fail_next: RwLock<usize>,
    fail_containing: RwLock<Vec<String>>,
    subscriptions: RwLock<Vec<SubscriptionSpec>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Fail the next `n` publishes or replies, then succeed.
    pub async fn fail_next(&self, n: usize) {
        *self.fail_next.write().await = n;
    }

    /// Fail every publish whose payload contains `needle`.
    pub async fn fail_containing(&self, needle: impl Into<String>) {
        self.fail_containing.write().await.push(needle.into());
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<MockCall> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<MockCall> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionSpec> {
        self.subscriptions.read().await.clone()
    }

    async fn record(&self, reply: bool, subject: &str, payload: Bytes) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        {
            let mut remaining = self.fail_next.write().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::Publish("Mock publish failure".to_string()));
            }
        }
        let text = String::from_utf8_lossy(&payload).into_owned();
        if self
            .fail_containing
            .read()
            .await
            .iter()
            .any(|needle| text.contains(needle.as_str()))
        {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }

        self.published.write().await.push(MockCall {
            reply,
            subject: subject.to_string(),
            payload,
        });
        Ok(())
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.record(false, subject, payload).await
    }

    async fn reply(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.record(true, subject, payload).await
    }

    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        _handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.subscriptions.write().await.push(spec);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_publish_and_reply() {
        let transport = MockTransport::new();
        transport
            .publish("events", Bytes::from_static(b"{\"a\":1}"))
            .await
            .unwrap();
        transport
            .reply("_INBOX.1", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let calls = transport.take_published().await;
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].reply);
        assert_eq!(calls[0].json()["a"], 1);
        assert!(calls[1].reply);
        assert_eq!(transport.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_fail_next_then_succeed() {
        let transport = MockTransport::new();
        transport.fail_next(2).await;

        assert!(transport.publish("events", Bytes::new()).await.is_err());
        assert!(transport.publish("events", Bytes::new()).await.is_err());
        assert!(transport.publish("events", Bytes::new()).await.is_ok());
        assert_eq!(transport.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_fail_on_publish() {
        let transport = MockTransport::new();
        transport.set_fail_on_publish(true).await;
        assert!(matches!(
            transport.publish("events", Bytes::new()).await,
            Err(BusError::Publish(_))
        ));
    }
}
