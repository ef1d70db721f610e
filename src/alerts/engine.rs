// =============================================================================
// Alert Engine — orchestrates manager, store, provider and dispatcher
// =============================================================================
//
// Owns the symbol index and keeps one invariant at all times: the provider's
// subscription set equals the set of symbols with at least one live alert.
//
// All mutation happens on the engine's own event loop. Store change-feed
// frames and provider ticks are funneled into a single channel, so the
// manager never needs a lock.
//
// Firing order per alert: enqueue to dispatcher → mark triggered in the
// store → remove locally. A failing store write is logged and tolerated —
// the local removal already prevents a re-fire, and the next startup
// re-reads active alerts to reconcile.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::alerts::evaluator::evaluate_alert;
use crate::alerts::manager::AlertManager;
use crate::alerts::models::{Alert, ChangeUpdate};
use crate::alerts::provider::AlertDataProvider;
use crate::alerts::store::{AlertStore, StoreChange};

/// Engine inbox capacity. Ticks and row changes share the same lane.
const EVENT_CAPACITY: usize = 1024;

/// Everything the engine reacts to.
#[derive(Debug)]
pub enum EngineEvent {
    Tick(ChangeUpdate),
    Change(StoreChange),
}

pub struct AlertEngine {
    manager: AlertManager,
    store: Arc<dyn AlertStore>,
    provider: Arc<dyn AlertDataProvider>,
    dispatch_tx: mpsc::Sender<Alert>,

    event_tx: Option<mpsc::Sender<EngineEvent>>,
    event_rx: Option<mpsc::Receiver<EngineEvent>>,
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn AlertStore>,
        provider: Arc<dyn AlertDataProvider>,
        dispatch_tx: mpsc::Sender<Alert>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            manager: AlertManager::new(),
            store,
            provider,
            dispatch_tx,
            event_tx: Some(event_tx),
            event_rx: Some(event_rx),
        }
    }

    /// Sender used to wire the store feed and the tick pump into the loop.
    pub fn event_sender(&self) -> mpsc::Sender<EngineEvent> {
        self.event_tx
            .as_ref()
            .expect("engine already running")
            .clone()
    }

    /// Load live alerts, subscribe their symbols, then run the event loop
    /// until every sender is gone. A store read failure here is fatal.
    pub async fn run(mut self) -> Result<()> {
        info!("alert engine starting");
        self.sync_existing_alerts().await?;

        // Provider ticks ride the shared inbox.
        let (tick_tx, mut tick_rx) = mpsc::channel::<ChangeUpdate>(EVENT_CAPACITY);
        let inbox = self.event_sender();
        tokio::spawn(async move {
            while let Some(update) = tick_rx.recv().await {
                if inbox.send(EngineEvent::Tick(update)).await.is_err() {
                    return;
                }
            }
        });
        self.provider.start(tick_tx).await?;

        let mut events = self.event_rx.take().expect("engine already running");
        // Drop our own sender so the loop ends when external feeds hang up.
        self.event_tx = None;

        info!(alerts = self.manager.len(), "alert engine running");
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Tick(update) => self.on_tick(&update).await,
                EngineEvent::Change(StoreChange::Insert(alert)) => self.on_insert(alert).await,
                EngineEvent::Change(StoreChange::Update(alert)) => self.on_update(alert).await,
                EngineEvent::Change(StoreChange::Delete(alert)) => self.on_delete(&alert).await,
            }
        }

        info!("alert engine event loop ended");
        Ok(())
    }

    /// Startup reconciliation: the store's live alerts become the index and
    /// the subscription set.
    async fn sync_existing_alerts(&mut self) -> Result<()> {
        let alerts = self
            .store
            .fetch_active_alerts()
            .await
            .context("failed to load active alerts at startup")?;
        info!(count = alerts.len(), "loaded active alerts from store");

        for alert in alerts {
            let symbol = alert.symbol.clone();
            self.manager.add(alert);
            self.provider.subscribe(&symbol).await;
        }
        Ok(())
    }

    /// Evaluate every alert on the tick's symbol against a stable snapshot;
    /// fired alerts leave the index before the next event is processed, so a
    /// firing is observed at most once.
    pub(crate) async fn on_tick(&mut self, update: &ChangeUpdate) {
        let snapshot: Vec<Alert> = self.manager.get(&update.symbol).to_vec();
        if snapshot.is_empty() {
            return;
        }

        for alert in snapshot {
            if !evaluate_alert(&alert, update) {
                continue;
            }
            info!(
                symbol = %update.symbol,
                alert_id = %alert.id,
                ltp = update.ltp,
                "alert triggered"
            );

            if self.dispatch_tx.send(alert.clone()).await.is_err() {
                error!(alert_id = %alert.id, "dispatcher queue closed — notification lost");
            }

            if let Err(e) = self.store.mark_triggered(&alert.id, update.ltp).await {
                error!(alert_id = %alert.id, error = %e, "failed to mark alert triggered");
            }

            self.manager.remove(&alert);
        }

        if !self.manager.has_alerts_for(&update.symbol) {
            self.provider.unsubscribe(&update.symbol).await;
        }
    }

    pub(crate) async fn on_insert(&mut self, alert: Alert) {
        debug!(alert_id = %alert.id, "insert alert");
        let symbol = alert.symbol.clone();
        self.manager.add(alert);
        self.provider.subscribe(&symbol).await;
    }

    pub(crate) async fn on_update(&mut self, alert: Alert) {
        debug!(alert_id = %alert.id, "update alert");
        let symbol = alert.symbol.clone();
        let previous = self.manager.remove_by_id(&alert.id);
        self.manager.add(alert);

        // The symbol may have moved; drop a now-empty old subscription.
        if let Some(previous) = previous {
            if previous.symbol != symbol && !self.manager.has_alerts_for(&previous.symbol) {
                self.provider.unsubscribe(&previous.symbol).await;
            }
        }
        self.provider.subscribe(&symbol).await;
    }

    pub(crate) async fn on_delete(&mut self, alert: &Alert) {
        debug!(alert_id = %alert.id, "delete alert");
        if let Some(removed) = self.manager.remove_by_id(&alert.id) {
            if !self.manager.has_alerts_for(&removed.symbol) {
                self.provider.unsubscribe(&removed.symbol).await;
            }
        }
    }

    #[cfg(test)]
    fn manager(&self) -> &AlertManager {
        &self.manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::models::{Operator, Point, RhsAttr, RhsType};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    // ── Test doubles ────────────────────────────────────────────────────

    #[derive(Default)]
    struct RecordingStore {
        active: Mutex<Vec<Alert>>,
        triggered: Mutex<Vec<(String, f64)>>,
        fail_writes: bool,
    }

    #[async_trait]
    impl AlertStore for RecordingStore {
        async fn fetch_active_alerts(&self) -> Result<Vec<Alert>> {
            Ok(self.active.lock().clone())
        }

        async fn mark_triggered(&self, alert_id: &str, price: f64) -> Result<()> {
            if self.fail_writes {
                anyhow::bail!("simulated store outage");
            }
            self.triggered.lock().push((alert_id.to_string(), price));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingProvider {
        subscribed: Mutex<Vec<String>>,
        unsubscribed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertDataProvider for RecordingProvider {
        async fn subscribe(&self, symbol: &str) {
            self.subscribed.lock().push(symbol.to_string());
        }

        async fn unsubscribe(&self, symbol: &str) {
            self.unsubscribed.lock().push(symbol.to_string());
        }

        async fn start(&self, _ticks: mpsc::Sender<ChangeUpdate>) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {}
    }

    fn constant_alert(id: &str, symbol: &str, op: Operator, value: f64) -> Alert {
        Alert {
            id: id.into(),
            user_id: "u".into(),
            symbol: symbol.into(),
            is_active: true,
            notes: None,
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
            alert_type: "simple".into(),
            lhs_type: "last_price".into(),
            lhs_attr: None,
            operator: op,
            rhs_type: RhsType::Constant,
            rhs_attr: RhsAttr {
                constant: Some(value),
                trend_line: None,
            },
            last_triggered_at: None,
            last_triggered_price: None,
        }
    }

    fn tick(symbol: &str, ltp: f64) -> ChangeUpdate {
        ChangeUpdate {
            symbol: symbol.into(),
            ltp,
            ltt: Utc::now(),
            ltq: 10.0,
        }
    }

    struct Harness {
        engine: AlertEngine,
        store: Arc<RecordingStore>,
        provider: Arc<RecordingProvider>,
        dispatched: mpsc::Receiver<Alert>,
    }

    fn harness() -> Harness {
        let store = Arc::new(RecordingStore::default());
        let provider = Arc::new(RecordingProvider::default());
        let (tx, rx) = mpsc::channel(64);
        let engine = AlertEngine::new(store.clone(), provider.clone(), tx);
        Harness {
            engine,
            store,
            provider,
            dispatched: rx,
        }
    }

    // ── Scenarios ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn constant_greater_than_fires_exactly_once() {
        let mut h = harness();
        h.engine
            .on_insert(constant_alert("A", "NSE:X", Operator::Gt, 100.0))
            .await;
        assert_eq!(h.provider.subscribed.lock().as_slice(), ["NSE:X"]);

        // Below threshold — nothing happens.
        h.engine.on_tick(&tick("NSE:X", 99.0)).await;
        assert!(h.store.triggered.lock().is_empty());
        assert_eq!(h.engine.manager().len(), 1);

        // Crosses: dispatched, marked, removed, unsubscribed.
        h.engine.on_tick(&tick("NSE:X", 100.0001)).await;
        let fired = h.dispatched.try_recv().expect("alert should dispatch");
        assert_eq!(fired.id, "A");
        assert_eq!(h.store.triggered.lock().as_slice(), [("A".to_string(), 100.0001)]);
        assert!(h.engine.manager().is_empty());
        assert_eq!(h.provider.unsubscribed.lock().as_slice(), ["NSE:X"]);

        // A later tick cannot re-fire the removed alert.
        h.engine.on_tick(&tick("NSE:X", 101.0)).await;
        assert!(h.dispatched.try_recv().is_err());
        assert_eq!(h.store.triggered.lock().len(), 1);
    }

    #[tokio::test]
    async fn trendline_alert_fires_on_interpolated_threshold() {
        let mut h = harness();
        let mut alert = constant_alert("T", "NSE:X", Operator::Ge, 0.0);
        alert.rhs_type = RhsType::TrendLine;
        alert.rhs_attr = RhsAttr {
            constant: None,
            trend_line: Some(vec![
                Point {
                    time: Utc.timestamp_opt(0, 0).unwrap(),
                    price: 100.0,
                },
                Point {
                    time: Utc.timestamp_opt(100, 0).unwrap(),
                    price: 200.0,
                },
            ]),
        };
        h.engine.on_insert(alert).await;

        let mut below = tick("NSE:X", 149.999);
        below.ltt = Utc.timestamp_opt(50, 0).unwrap();
        h.engine.on_tick(&below).await;
        assert_eq!(h.engine.manager().len(), 1);

        let mut at = tick("NSE:X", 150.0);
        at.ltt = Utc.timestamp_opt(50, 0).unwrap();
        h.engine.on_tick(&at).await;
        assert!(h.engine.manager().is_empty());
        assert_eq!(h.store.triggered.lock().as_slice(), [("T".to_string(), 150.0)]);
    }

    #[tokio::test]
    async fn subscription_set_mirrors_live_alert_symbols() {
        let mut h = harness();
        h.engine
            .on_insert(constant_alert("A", "NSE:X", Operator::Gt, 1000.0))
            .await;
        h.engine
            .on_insert(constant_alert("B", "NSE:X", Operator::Lt, 1.0))
            .await;

        // Delete one of two on the symbol — still subscribed.
        h.engine
            .on_delete(&constant_alert("A", "NSE:X", Operator::Gt, 1000.0))
            .await;
        assert!(h.provider.unsubscribed.lock().is_empty());

        // Delete the last one — unsubscribed.
        h.engine
            .on_delete(&constant_alert("B", "NSE:X", Operator::Lt, 1.0))
            .await;
        assert_eq!(h.provider.unsubscribed.lock().as_slice(), ["NSE:X"]);
    }

    #[tokio::test]
    async fn update_moving_symbol_rewires_subscriptions() {
        let mut h = harness();
        h.engine
            .on_insert(constant_alert("A", "NSE:X", Operator::Gt, 10.0))
            .await;

        h.engine
            .on_update(constant_alert("A", "NSE:Y", Operator::Gt, 10.0))
            .await;

        assert!(h.engine.manager().has_alerts_for("NSE:Y"));
        assert!(!h.engine.manager().has_alerts_for("NSE:X"));
        assert!(h.provider.unsubscribed.lock().contains(&"NSE:X".to_string()));
        assert!(h.provider.subscribed.lock().contains(&"NSE:Y".to_string()));
        assert_eq!(h.engine.manager().len(), 1);
    }

    #[tokio::test]
    async fn store_write_failure_still_removes_locally() {
        let store = Arc::new(RecordingStore {
            fail_writes: true,
            ..Default::default()
        });
        let provider = Arc::new(RecordingProvider::default());
        let (tx, mut rx) = mpsc::channel(8);
        let mut engine = AlertEngine::new(store.clone(), provider.clone(), tx);

        engine
            .on_insert(constant_alert("A", "NSE:X", Operator::Gt, 100.0))
            .await;
        engine.on_tick(&tick("NSE:X", 101.0)).await;

        // Dispatch still happened; index is clean despite the failed write.
        assert!(rx.try_recv().is_ok());
        assert!(engine.manager().is_empty());
        assert!(store.triggered.lock().is_empty());
    }

    #[tokio::test]
    async fn only_matching_alerts_on_the_symbol_fire() {
        let mut h = harness();
        h.engine
            .on_insert(constant_alert("A", "NSE:X", Operator::Gt, 100.0))
            .await;
        h.engine
            .on_insert(constant_alert("B", "NSE:X", Operator::Gt, 500.0))
            .await;

        h.engine.on_tick(&tick("NSE:X", 200.0)).await;

        assert_eq!(h.store.triggered.lock().len(), 1);
        assert_eq!(h.engine.manager().len(), 1);
        assert_eq!(h.engine.manager().get("NSE:X")[0].id, "B");
        // B still holds the subscription.
        assert!(h.provider.unsubscribed.lock().is_empty());
    }
}
