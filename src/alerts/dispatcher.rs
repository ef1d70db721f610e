// =============================================================================
// Notification Dispatcher — FIFO queue + isolated handlers
// =============================================================================
//
// Triggered alerts are enqueued by the engine and drained by a single
// dispatch task. Handlers run in registration order and are individually
// failure-isolated: one handler erroring never stops the others or the loop.
//
// The queue is bounded. Alerts are not droppable, so `enqueue` awaits for
// capacity instead of discarding under a slow consumer.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::alerts::models::Alert;

/// Queue depth before `enqueue` starts exerting backpressure.
const QUEUE_CAPACITY: usize = 256;

/// Timeout applied to outbound handler HTTP calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

// ---------------------------------------------------------------------------
// Handler seam
// ---------------------------------------------------------------------------

/// A notification sink for triggered alerts. Retry policy is a handler
/// concern; the dispatcher only guarantees isolation and ordering.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    /// Short name used in failure logs.
    fn name(&self) -> &str;

    async fn handle(&self, alert: &Alert) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Webhook handler (built-in)
// ---------------------------------------------------------------------------

/// POSTs `{"alert": <alert>}` to a configured URL. Non-2xx responses are
/// logged and dropped — delivery is best-effort.
pub struct WebhookHandler {
    url: String,
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self { url, client }
    }
}

#[async_trait]
impl AlertHandler for WebhookHandler {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn handle(&self, alert: &Alert) -> Result<()> {
        let body = serde_json::json!({ "alert": alert });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("webhook POST failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(alert_id = %alert.id, %status, body = %text, "webhook rejected alert");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Owns the handler list and the sending half of the queue. The draining
/// task is spawned by [`start`](Self::start) and owns the receiving half.
pub struct NotificationDispatcher {
    handlers: Vec<Arc<dyn AlertHandler>>,
    tx: mpsc::Sender<Alert>,
    rx: Option<mpsc::Receiver<Alert>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            handlers: Vec::new(),
            tx,
            rx: Some(rx),
        }
    }

    /// Append a handler. Invocation order is registration order.
    pub fn register_handler(&mut self, handler: Arc<dyn AlertHandler>) {
        self.handlers.push(handler);
    }

    /// Sender half for enqueueing triggered alerts. Await-based; blocks the
    /// caller rather than dropping when the queue is full.
    pub fn sender(&self) -> mpsc::Sender<Alert> {
        self.tx.clone()
    }

    /// Spawn the dispatch loop. Consumes the receiver; calling twice is a
    /// programming error.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let rx = self.rx.take().expect("dispatcher already started");
        let handlers = self.handlers.clone();
        tokio::spawn(dispatch_loop(rx, handlers))
    }
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(mut rx: mpsc::Receiver<Alert>, handlers: Vec<Arc<dyn AlertHandler>>) {
    info!(handlers = handlers.len(), "dispatcher loop started");
    while let Some(alert) = rx.recv().await {
        handle_alert(&alert, &handlers).await;
    }
    info!("dispatcher loop stopped (queue closed)");
}

async fn handle_alert(alert: &Alert, handlers: &[Arc<dyn AlertHandler>]) {
    for handler in handlers {
        if let Err(e) = handler.handle(alert).await {
            error!(
                alert_id = %alert.id,
                handler = handler.name(),
                error = %e,
                "alert handler failed"
            );
        }
    }
}
