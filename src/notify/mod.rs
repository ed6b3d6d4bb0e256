//! Best-effort notifications about newly detected escrows
//!
//! Delivery failures are logged and counted, they never reach the ledger.

use crate::config::NotificationConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::SwapSnapshot;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Payload posted for every newly inserted swap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: SwapSnapshot,
}

impl Notification {
    pub fn new_escrow(data: SwapSnapshot) -> Self {
        Self {
            kind: "new_escrow",
            data,
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &Notification) -> RelayerResult<()>;
}

/// Discards notifications
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
    async fn notify(&self, notification: &Notification) -> RelayerResult<()> {
        debug!("Notification for {} dropped (no sink configured)", notification.data.id);
        Ok(())
    }
}

/// POSTs notifications as JSON to a webhook
pub struct WebhookSink {
    client: Client,
    url: String,
    retries: u32,
    backoff_ms: u64,
}

impl WebhookSink {
    pub fn new(url: String, timeout: Duration, retries: u32, backoff_ms: u64) -> RelayerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayerError::Config(format!("Failed to build webhook client: {}", e)))?;
        Ok(Self {
            client,
            url,
            retries,
            backoff_ms,
        })
    }

    /// `None` when no webhook URL is configured
    pub fn from_config(config: &NotificationConfig) -> RelayerResult<Option<Self>> {
        match &config.webhook_url {
            Some(url) => Self::new(
                url.clone(),
                Duration::from_secs(config.timeout_secs),
                config.retries,
                config.backoff_ms,
            )
            .map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, notification: &Notification) -> RelayerResult<()> {
        let mut attempt = 0u32;
        loop {
            let failure = match self.client.post(&self.url).json(notification).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("Webhook delivered for {}", notification.data.id);
                    return Ok(());
                }
                Ok(resp) => format!("webhook status {}", resp.status()),
                Err(err) => format!("webhook error: {}", err),
            };

            attempt += 1;
            if attempt > self.retries {
                return Err(RelayerError::Notification(failure));
            }
            warn!(
                "Webhook attempt {} for {} failed: {}",
                attempt, notification.data.id, failure
            );
            tokio::time::sleep(backoff_delay(self.backoff_ms, attempt)).await;
        }
    }
}

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ...
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1).min(31))
        .unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use ethers::types::H256;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records notifications in memory; optionally fails every call
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) seen: Mutex<Vec<Notification>>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, notification: &Notification) -> RelayerResult<()> {
            self.seen.lock().unwrap().push(notification.clone());
            if self.fail {
                return Err(RelayerError::Notification("sink down".into()));
            }
            Ok(())
        }
    }

    fn notification() -> Notification {
        let clock = ManualClock::default();
        let record = crate::state::test_record("0xabc", H256::repeat_byte(1), clock.now());
        Notification::new_escrow(record.snapshot())
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/hook", addr)
    }

    #[test]
    fn test_backoff_delay_doubles() {
        assert_eq!(backoff_delay(100, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(100, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(100, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(u64::MAX, 40), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_payload_shape() {
        let body = serde_json::to_value(notification()).unwrap();
        assert_eq!(body["type"], "new_escrow");
        assert_eq!(body["data"]["id"], "0xabc");
        assert_eq!(body["data"]["state"], "detected");
        assert!(body["data"].get("preimage").is_none());
    }

    #[tokio::test]
    async fn test_webhook_retries_until_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = serve(
            Router::new()
                .route(
                    "/hook",
                    post(|State(hits): State<Arc<AtomicUsize>>, Json(body): Json<Value>| async move {
                        assert_eq!(body["type"], "new_escrow");
                        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                            StatusCode::SERVICE_UNAVAILABLE
                        } else {
                            StatusCode::OK
                        }
                    }),
                )
                .with_state(hits.clone()),
        )
        .await;

        let sink = WebhookSink::new(url, Duration::from_secs(2), 2, 1).unwrap();
        sink.notify(&notification()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_webhook_gives_up_after_retries() {
        let url = serve(Router::new().route("/hook", post(|| async { StatusCode::BAD_GATEWAY })))
            .await;
        let sink = WebhookSink::new(url, Duration::from_secs(2), 1, 1).unwrap();
        let err = sink.notify(&notification()).await.unwrap_err();
        assert!(matches!(err, RelayerError::Notification(_)));
    }

    #[test]
    fn test_from_config_without_url_is_none() {
        let config = NotificationConfig::default();
        assert!(WebhookSink::from_config(&config).unwrap().is_none());
    }
}
