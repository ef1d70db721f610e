// =============================================================================
// Metadata Provider — per-symbol scalar features for static conditions
// =============================================================================
//
// Static conditions and static columns read precomputed per-symbol scalars
// (market cap, sector, ratings, ...). The provider projects them as plain
// JSON values; the expression environment converts on the way in.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use parking_lot::RwLock;

pub type MetadataRow = HashMap<String, serde_json::Value>;

pub trait MetadataProvider: Send + Sync {
    /// One property for one symbol.
    fn get_metadata(&self, symbol: &str, property: &str) -> Option<serde_json::Value>;

    /// Every property for one symbol.
    fn get_all_metadata(&self, symbol: &str) -> MetadataRow;

    /// symbol × property table restricted to `symbols`. Symbols without a
    /// row are simply absent from the result.
    fn metadata_table(&self, symbols: &[String]) -> HashMap<String, MetadataRow>;

    fn supported_properties(&self) -> Vec<String>;

    /// Reload from the backing source.
    fn refresh(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

type RowLoader = dyn Fn() -> Result<HashMap<String, MetadataRow>> + Send + Sync;

/// Holds the full symbol × property map in memory; `refresh` re-runs the
/// loader it was constructed with (typically a feature-table projection).
pub struct InMemoryMetadataProvider {
    rows: RwLock<HashMap<String, MetadataRow>>,
    loader: Option<Box<RowLoader>>,
}

impl InMemoryMetadataProvider {
    pub fn new(rows: HashMap<String, MetadataRow>) -> Self {
        Self {
            rows: RwLock::new(rows),
            loader: None,
        }
    }

    pub fn with_loader(loader: Box<RowLoader>) -> Result<Self> {
        let rows = loader()?;
        Ok(Self {
            rows: RwLock::new(rows),
            loader: Some(loader),
        })
    }

    pub fn symbols(&self) -> Vec<String> {
        self.rows.read().keys().cloned().collect()
    }
}

impl MetadataProvider for InMemoryMetadataProvider {
    fn get_metadata(&self, symbol: &str, property: &str) -> Option<serde_json::Value> {
        self.rows
            .read()
            .get(symbol)
            .and_then(|row| row.get(property))
            .filter(|v| !v.is_null())
            .cloned()
    }

    fn get_all_metadata(&self, symbol: &str) -> MetadataRow {
        self.rows.read().get(symbol).cloned().unwrap_or_default()
    }

    fn metadata_table(&self, symbols: &[String]) -> HashMap<String, MetadataRow> {
        let rows = self.rows.read();
        symbols
            .iter()
            .filter_map(|s| rows.get(s).map(|row| (s.clone(), row.clone())))
            .collect()
    }

    fn supported_properties(&self) -> Vec<String> {
        let rows = self.rows.read();
        let mut props: Vec<String> = rows
            .values()
            .next()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();
        props.sort();
        props
    }

    fn refresh(&self) -> Result<()> {
        if let Some(loader) = &self.loader {
            *self.rows.write() = loader()?;
        }
        Ok(())
    }
}
