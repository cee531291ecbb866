//! Outbound event delivery to the configured webhook sink.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use relay_core::events::SessionEvent;

const DELIVERY_ATTEMPTS: u32 = 3;

/// Fire-and-forget webhook poster. Delivery is at-least-once with a short
/// retry budget and never blocks the caller; with no URL configured every
/// event is dropped after a debug log.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    url: Option<Arc<String>>,
    retry_delay: Duration,
}

impl Notifier {
    pub fn new(url: Option<String>) -> Self {
        Self::with_retry_delay(url, Duration::from_millis(500))
    }

    pub fn with_retry_delay(url: Option<String>, retry_delay: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.map(Arc::new),
            retry_delay,
        }
    }

    /// Queue one event for delivery. Returns immediately; the POST happens on
    /// its own task.
    pub fn dispatch(&self, event: SessionEvent) {
        let Some(url) = self.url.clone() else {
            debug!(
                session_id = %event.session_id(),
                event = event.event_type(),
                "no webhook configured, dropping event"
            );
            return;
        };

        let client = self.client.clone();
        let retry_delay = self.retry_delay;
        tokio::spawn(async move {
            for attempt in 1..=DELIVERY_ATTEMPTS {
                match client.post(url.as_str()).json(&event).send().await {
                    Ok(resp) if resp.status().is_success() => return,
                    Ok(resp) => {
                        warn!(
                            session_id = %event.session_id(),
                            event = event.event_type(),
                            status = resp.status().as_u16(),
                            attempt,
                            "webhook rejected event"
                        );
                    }
                    Err(e) => {
                        warn!(
                            session_id = %event.session_id(),
                            event = event.event_type(),
                            error = %e,
                            attempt,
                            "webhook delivery failed"
                        );
                    }
                }
                if attempt < DELIVERY_ATTEMPTS {
                    tokio::time::sleep(retry_delay).await;
                }
            }
            warn!(
                session_id = %event.session_id(),
                event = event.event_type(),
                "webhook delivery exhausted retries, dropping event"
            );
        });
    }
}
