// =============================================================================
// Quote Scaler — shards a large ticker universe across bounded connections
// =============================================================================
//
// The upstream caps both concurrent connections per origin and symbols per
// session. The scaler assigns tickers to at most `max_connections` nodes of
// at most `max_tickers_per_connection` symbols each, and multiplexes every
// node's events into one fan-in channel.
//
// Assignment policy: fill existing nodes first, then open new nodes; tickers
// beyond total capacity are dropped (bounded-best-effort). Growing a running
// node restarts it with the full ticker list — rebuild beats incremental
// session surgery. Shrinking uses in-place `quote_remove_symbols`; a drained
// node is torn down.
//
// Backpressure: per-node queues are bounded. Lifecycle events (connected /
// disconnected / error) are delivered blocking; quote updates are replaceable
// and dropped when the fan-in is full.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::stream::streamer::{QuoteEvent, QuoteStreamEvent, QuoteStreamer, StreamerCommand};

/// Fan-in channel capacity shared by all nodes.
const EVENT_QUEUE_CAPACITY: usize = 4096;

/// Per-node queue capacity between a streamer and its pump.
const NODE_QUEUE_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Node bookkeeping
// ---------------------------------------------------------------------------

/// One upstream connection and its bounded ticker set.
#[derive(Debug, Clone)]
pub struct StreamingNode {
    pub id: u64,
    pub tickers: HashSet<String>,
    pub max_tickers: usize,
}

struct NodeRuntime {
    task: JoinHandle<()>,
    commands: mpsc::Sender<StreamerCommand>,
}

// ---------------------------------------------------------------------------
// Launcher seam — lets tests run the scaler without touching the network
// ---------------------------------------------------------------------------

pub trait NodeLauncher: Send + Sync {
    /// Start the streaming half of a node: produce events into `events`,
    /// accept `commands` until cancelled.
    fn launch(
        &self,
        node_id: u64,
        tickers: Vec<String>,
        events: mpsc::Sender<QuoteEvent>,
        commands: mpsc::Receiver<StreamerCommand>,
    ) -> JoinHandle<()>;
}

/// Production launcher: one `QuoteStreamer` per node.
struct StreamerLauncher {
    quote_fields: Vec<String>,
}

impl NodeLauncher for StreamerLauncher {
    fn launch(
        &self,
        node_id: u64,
        tickers: Vec<String>,
        events: mpsc::Sender<QuoteEvent>,
        commands: mpsc::Receiver<StreamerCommand>,
    ) -> JoinHandle<()> {
        let streamer = QuoteStreamer::new(self.quote_fields.clone());
        tokio::spawn(async move {
            info!(node = node_id, tickers = tickers.len(), "node streamer started");
            streamer.run(tickers, events, commands).await;
            info!(node = node_id, "node streamer stopped");
        })
    }
}

// ---------------------------------------------------------------------------
// Scaler
// ---------------------------------------------------------------------------

pub struct QuoteScaler {
    max_connections: usize,
    max_tickers_per_connection: usize,
    launcher: Arc<dyn NodeLauncher>,

    nodes: BTreeMap<u64, StreamingNode>,
    ticker_to_node: HashMap<String, u64>,
    runtimes: HashMap<u64, NodeRuntime>,

    quotes: Arc<RwLock<HashMap<String, Value>>>,
    event_tx: mpsc::Sender<QuoteEvent>,
    event_rx: Option<mpsc::Receiver<QuoteEvent>>,
    running: bool,
}

impl QuoteScaler {
    pub fn new(quote_fields: Vec<String>, max_connections: usize, max_tickers_per_connection: usize) -> Self {
        Self::with_launcher(
            Arc::new(StreamerLauncher { quote_fields }),
            max_connections,
            max_tickers_per_connection,
        )
    }

    pub fn with_launcher(
        launcher: Arc<dyn NodeLauncher>,
        max_connections: usize,
        max_tickers_per_connection: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            max_connections,
            max_tickers_per_connection,
            launcher,
            nodes: BTreeMap::new(),
            ticker_to_node: HashMap::new(),
            runtimes: HashMap::new(),
            quotes: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Some(event_rx),
            running: false,
        }
    }

    pub fn start(&mut self) {
        if !self.running {
            self.running = true;
            info!("scaler started");
        }
    }

    /// Take the fan-in receiver of `(event, ticker, data)` across all nodes.
    /// Ordering between tickers on different nodes is unspecified; within a
    /// ticker it follows that ticker's node.
    pub fn quote_events(&mut self) -> mpsc::Receiver<QuoteEvent> {
        self.event_rx.take().expect("quote_events already taken")
    }

    /// Assign new tickers to nodes. Already-assigned tickers are ignored;
    /// tickers beyond total capacity are dropped with a warning. Every node
    /// whose set changed is restarted with its full current list.
    pub async fn add_tickers(&mut self, tickers: &[String]) {
        self.start();

        let mut unassigned: Vec<String> = tickers
            .iter()
            .filter(|t| !self.ticker_to_node.contains_key(*t))
            .cloned()
            .collect();
        // A caller may repeat a ticker within one batch.
        let mut seen = HashSet::new();
        unassigned.retain(|t| seen.insert(t.clone()));
        if unassigned.is_empty() {
            return;
        }

        let mut changed: HashSet<u64> = HashSet::new();

        // Pass 1: fill existing nodes up to their remaining capacity.
        for (node_id, node) in self.nodes.iter_mut() {
            if unassigned.is_empty() {
                break;
            }
            let capacity = node.max_tickers.saturating_sub(node.tickers.len());
            if capacity == 0 {
                continue;
            }
            let take = capacity.min(unassigned.len());
            for t in unassigned.drain(..take) {
                node.tickers.insert(t.clone());
                self.ticker_to_node.insert(t, *node_id);
            }
            changed.insert(*node_id);
        }

        // Pass 2: open fresh nodes while capacity remains.
        while !unassigned.is_empty() && self.nodes.len() < self.max_connections {
            let node_id = self.next_node_id();
            let take = self.max_tickers_per_connection.min(unassigned.len());
            let batch: Vec<String> = unassigned.drain(..take).collect();

            let mut node = StreamingNode {
                id: node_id,
                tickers: HashSet::new(),
                max_tickers: self.max_tickers_per_connection,
            };
            for t in batch {
                node.tickers.insert(t.clone());
                self.ticker_to_node.insert(t, node_id);
            }
            self.nodes.insert(node_id, node);
            changed.insert(node_id);
        }

        if !unassigned.is_empty() {
            warn!(
                dropped = unassigned.len(),
                "ticker universe exceeds total capacity — dropping overflow"
            );
        }

        self.restart_nodes(changed).await;
    }

    /// Remove tickers from their nodes. Still-populated nodes shed symbols
    /// in place; drained nodes are torn down.
    pub async fn remove_tickers(&mut self, tickers: &[String]) {
        let mut per_node: HashMap<u64, Vec<String>> = HashMap::new();

        for t in tickers {
            let Some(node_id) = self.ticker_to_node.remove(t) else {
                continue;
            };
            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.tickers.remove(t);
            }
            self.quotes.write().remove(t);
            per_node.entry(node_id).or_default().push(t.clone());
        }

        for (node_id, symbols) in per_node {
            let node_empty = self
                .nodes
                .get(&node_id)
                .map(|n| n.tickers.is_empty())
                .unwrap_or(true);

            if node_empty {
                self.teardown_node(node_id);
                continue;
            }

            // In-place removal — no reconnect for the survivors.
            let commands = self.runtimes.get(&node_id).map(|rt| rt.commands.clone());
            if let Some(commands) = commands {
                if commands
                    .send(StreamerCommand::RemoveSymbols(symbols))
                    .await
                    .is_err()
                {
                    warn!(node = node_id, "node command channel closed — restarting node");
                    self.restart_nodes([node_id].into_iter().collect()).await;
                }
            }
        }
    }

    /// Cancel every node task and clear all state.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        for (node_id, rt) in self.runtimes.drain() {
            rt.task.abort();
            debug!(node = node_id, "node task cancelled");
        }
        self.nodes.clear();
        self.ticker_to_node.clear();
        self.quotes.write().clear();
        info!("scaler stopped");
    }

    /// Latest merged quote for a ticker, if one has been observed.
    pub fn get_quote(&self, ticker: &str) -> Option<Value> {
        self.quotes.read().get(ticker).cloned()
    }

    pub fn get_all_quotes(&self) -> HashMap<String, Value> {
        self.quotes.read().clone()
    }

    // ── Introspection used by callers and tests ─────────────────────────

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &StreamingNode> {
        self.nodes.values()
    }

    pub fn node_for(&self, ticker: &str) -> Option<u64> {
        self.ticker_to_node.get(ticker).copied()
    }

    pub fn assigned_ticker_count(&self) -> usize {
        self.ticker_to_node.len()
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Smallest unused node id, so torn-down slots are reused.
    fn next_node_id(&self) -> u64 {
        let mut id = 1;
        while self.nodes.contains_key(&id) {
            id += 1;
        }
        id
    }

    fn teardown_node(&mut self, node_id: u64) {
        if let Some(rt) = self.runtimes.remove(&node_id) {
            rt.task.abort();
        }
        self.nodes.remove(&node_id);
        info!(node = node_id, "node torn down");
    }

    /// Cancel and respawn every listed node with its full current ticker
    /// list. Rebuild-over-patch keeps the session invariants simple.
    async fn restart_nodes(&mut self, node_ids: HashSet<u64>) {
        for node_id in node_ids {
            let Some(node) = self.nodes.get(&node_id) else {
                self.teardown_node(node_id);
                continue;
            };
            if node.tickers.is_empty() {
                self.teardown_node(node_id);
                continue;
            }

            if let Some(rt) = self.runtimes.remove(&node_id) {
                rt.task.abort();
            }

            let tickers: Vec<String> = node.tickers.iter().cloned().collect();
            let (node_tx, node_rx) = mpsc::channel(NODE_QUEUE_CAPACITY);
            let (cmd_tx, cmd_rx) = mpsc::channel(16);

            let streamer_task = self.launcher.launch(node_id, tickers, node_tx, cmd_rx);
            let pump = spawn_node_pump(node_id, node_rx, self.event_tx.clone(), self.quotes.clone());

            // One handle owns both halves; aborting it cancels the pump, and
            // dropping the pump's receiver ends the streamer side.
            let task = tokio::spawn(async move {
                let _ = pump.await;
                streamer_task.abort();
            });

            self.runtimes.insert(node_id, NodeRuntime { task, commands: cmd_tx });
            info!(node = node_id, "node (re)started");
        }
    }
}

/// Forward a node's events into the fan-in, maintaining the latest-quote map.
/// Quote updates use `try_send` and are dropped when the fan-in is full;
/// lifecycle events block for capacity.
fn spawn_node_pump(
    node_id: u64,
    mut node_rx: mpsc::Receiver<QuoteEvent>,
    fan_in: mpsc::Sender<QuoteEvent>,
    quotes: Arc<RwLock<HashMap<String, Value>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = node_rx.recv().await {
            if let (QuoteStreamEvent::QuoteUpdate | QuoteStreamEvent::QuoteCompleted, Some(ticker)) =
                (event.kind, event.ticker.as_ref())
            {
                quotes.write().insert(ticker.clone(), event.data.clone());
            }

            match event.kind {
                QuoteStreamEvent::QuoteUpdate => {
                    if let Err(mpsc::error::TrySendError::Closed(_)) = fan_in.try_send(event) {
                        return;
                    }
                    // Full: quote dropped — replaceable by the next delta.
                }
                _ => {
                    if fan_in.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
        debug!(node = node_id, "node pump drained");
    })
}
