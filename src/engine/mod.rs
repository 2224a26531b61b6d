use std::collections::HashMap;
use std::error;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::path::{Family, Path, PathList, RouteDistinguisher};

/// Which engine event streams a watcher subscribes to
#[derive(Clone, Copy, Debug)]
pub struct WatchOptions {
    pub best_path: bool,
    pub post_update: bool,
}

/// Event flavors delivered by the engine watcher. `vrf` maps NLRI
/// rendering to the VRF id a path should be installed into.
#[derive(Clone, Debug)]
pub enum WatchEvent {
    BestPath {
        paths: PathList,
        /// Destination-grouped batches; non-empty when the engine runs
        /// with multiple-path selection enabled
        multipath: Vec<PathList>,
        vrf: HashMap<String, u16>,
    },
    PostUpdate {
        paths: PathList,
        vrf: HashMap<String, u16>,
    },
}

pub type WatchEventTx = mpsc::UnboundedSender<WatchEvent>;

/// Receiving side of an engine watch subscription. The watcher keeps a
/// sender of its own channel so current state can be replayed through
/// the same stream the engine feeds.
pub struct Watcher {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    tx: WatchEventTx,
}

impl Watcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { rx, tx }
    }

    pub fn sender(&self) -> WatchEventTx {
        self.tx.clone()
    }

    pub async fn event(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Ends the subscription; the engine notices on its next send
    pub fn stop(self) {}
}

impl Default for Watcher {
    fn default() -> Self {
        Self::new()
    }
}

/// A VRF known to the engine, scoped by its route distinguisher
#[derive(Clone, Debug)]
pub struct Vrf {
    pub id: u16,
    pub name: String,
    pub rd: Option<RouteDistinguisher>,
}

impl Vrf {
    /// Can this VRF import the given path (route distinguishers match)
    pub fn can_import(&self, path: &Path) -> bool {
        match (path.nlri.rd, self.rd) {
            (Some(path_rd), Some(vrf_rd)) => path_rd == vrf_rd,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// The engine refused the submitted paths. [reason]
    Rejected(String),
    /// No RIB table is available for the requested family. [family]
    NoRib(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use EngineError::*;
        match self {
            Rejected(reason) => write!(f, "Engine rejected paths: {}", reason),
            NoRib(family) => write!(f, "No RIB for family {}", family),
        }
    }
}

impl error::Error for EngineError {}

/// The BGP engine as seen from the bridge: watch subscriptions, path
/// ingress, and family/VRF scoped views of the RIB. The engine owns
/// path selection; the bridge only feeds and observes it.
#[async_trait]
pub trait RouteServer: Send + Sync {
    /// Subscribe to bestpath/postupdate streams
    fn watch(&self, opts: WatchOptions) -> Watcher;

    /// Inject externally-sourced paths into the RIB
    async fn add_path(&self, paths: PathList) -> Result<(), EngineError>;

    /// Re-inject updated clones of existing paths
    async fn update_path(&self, paths: PathList) -> Result<(), EngineError>;

    /// Family-scoped snapshot of the global RIB
    async fn rib_snapshot(&self, family: Family) -> Result<PathList, EngineError>;

    /// All VRFs currently configured on the engine
    async fn vrfs(&self) -> Vec<Vrf>;

    /// Known path batches for an existing VRF table, one batch per
    /// destination. None if no such VRF table exists.
    async fn vrf_destinations(&self, name: &str) -> Option<Vec<PathList>>;
}
