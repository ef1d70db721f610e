pub mod cache;
pub mod candles;
pub mod engine;
pub mod expr;
pub mod indicators;
pub mod metadata;
pub mod models;

pub use engine::{MarketState, ScannerEngine};
