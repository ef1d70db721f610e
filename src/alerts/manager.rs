// =============================================================================
// Alert Manager — symbol → alerts index
// =============================================================================
//
// Pure in-memory index owned by the engine task; no locking, no I/O. Buckets
// keep insertion order and are pruned as soon as they drain so that
// `has_alerts_for` doubles as the provider-unsubscribe signal.
// =============================================================================

use std::collections::HashMap;

use crate::alerts::models::Alert;

/// In-memory index of live alerts keyed by symbol.
#[derive(Debug, Default)]
pub struct AlertManager {
    alerts_by_symbol: HashMap<String, Vec<Alert>>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an alert to its symbol bucket, creating the bucket if absent.
    /// Not idempotent — callers re-adding a known id must go through
    /// [`update`](Self::update).
    pub fn add(&mut self, alert: Alert) {
        self.alerts_by_symbol
            .entry(alert.symbol.clone())
            .or_default()
            .push(alert);
    }

    /// Replace any existing alert with the same id (wherever it lives — the
    /// symbol may have changed across versions), then add the new version.
    pub fn update(&mut self, alert: Alert) {
        self.remove_by_id(&alert.id);
        self.add(alert);
    }

    /// Drop an alert by `(symbol, id)`, pruning the bucket when it empties.
    pub fn remove(&mut self, alert: &Alert) {
        if let Some(bucket) = self.alerts_by_symbol.get_mut(&alert.symbol) {
            bucket.retain(|a| a.id != alert.id);
            if bucket.is_empty() {
                self.alerts_by_symbol.remove(&alert.symbol);
            }
        }
    }

    /// Scan all buckets for the first alert with the given id, remove it and
    /// return it. The caller needs the removed alert to know which symbol to
    /// unsubscribe. O(N) over live alerts, which is bounded and fine.
    pub fn remove_by_id(&mut self, id: &str) -> Option<Alert> {
        let mut found: Option<(String, usize)> = None;
        for (symbol, bucket) in self.alerts_by_symbol.iter() {
            if let Some(pos) = bucket.iter().position(|a| a.id == id) {
                found = Some((symbol.clone(), pos));
                break;
            }
        }

        let (symbol, pos) = found?;
        let bucket = self.alerts_by_symbol.get_mut(&symbol)?;
        let removed = bucket.remove(pos);
        if bucket.is_empty() {
            self.alerts_by_symbol.remove(&symbol);
        }
        Some(removed)
    }

    /// Alerts currently indexed for a symbol, in insertion order.
    pub fn get(&self, symbol: &str) -> &[Alert] {
        self.alerts_by_symbol
            .get(symbol)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether any alert is indexed for the symbol.
    pub fn has_alerts_for(&self, symbol: &str) -> bool {
        self.alerts_by_symbol
            .get(symbol)
            .is_some_and(|b| !b.is_empty())
    }

    /// All symbols with at least one alert. Drives the subscription
    /// reconciliation invariant.
    pub fn symbols(&self) -> Vec<String> {
        self.alerts_by_symbol.keys().cloned().collect()
    }

    /// Total number of indexed alerts.
    pub fn len(&self) -> usize {
        self.alerts_by_symbol.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts_by_symbol.is_empty()
    }
}
