use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, trace};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::engine::RouteServer;
use crate::path::{Path, PathList};

/// Penalty charged for every incoming batch
const PENALTY_STEP: u32 = 500;
/// Penalty level above which the delay starts growing
const PENALTY_THRESHOLD: u32 = 950;
/// Decay tick period, in delay units
const DECAY_TICK_UNITS: u32 = 8;

/// Handle for feeding the tracker. Owns the registration cache, which
/// is shared with the translators under a short-held lock; every cached
/// address belongs to at least one active path unless an unregister is
/// in flight.
#[derive(Clone)]
pub struct Nht {
    cache: Arc<Mutex<HashSet<String>>>,
    path_tx: mpsc::UnboundedSender<PathList>,
}

impl Nht {
    pub fn is_registered(&self, nexthop: &IpAddr) -> bool {
        self.cache.lock().unwrap().contains(&nexthop.to_string())
    }

    /// Record a nexthop as registered. Returns false if it already was.
    pub fn register(&self, nexthop: IpAddr) -> bool {
        self.cache.lock().unwrap().insert(nexthop.to_string())
    }

    pub fn unregister(&self, nexthop: &IpAddr) {
        self.cache.lock().unwrap().remove(&nexthop.to_string());
    }

    /// Queue a batch of updated paths for a damped engine submission
    pub fn schedule(&self, paths: PathList) {
        if paths.is_empty() {
            return;
        }
        // The tracker only goes away once the bridge does
        let _ = self.path_tx.send(paths);
    }

    /// Keep only paths whose nexthop still needs registering: locally
    /// learned, active, with a specific nexthop not yet in the cache
    pub fn filter_paths_to_register(&self, paths: &[Arc<Path>]) -> PathList {
        paths
            .iter()
            .filter(|path| {
                if path.from_external || path.is_withdraw || path.is_nexthop_invalid {
                    return false;
                }
                !path.nexthop.is_unspecified() && !self.is_registered(&path.nexthop)
            })
            .cloned()
            .collect()
    }
}

/// Detached handle plus the receiving end of its batch channel, for
/// exercising the translators without a running tracker.
#[cfg(test)]
pub(crate) fn test_handle() -> (Nht, mpsc::UnboundedReceiver<PathList>) {
    let (path_tx, path_rx) = mpsc::unbounded_channel();
    let handle = Nht {
        cache: Arc::new(Mutex::new(HashSet::new())),
        path_tx,
    };
    (handle, path_rx)
}

/// Aggregates nexthop reachability churn. Every incoming batch charges
/// a penalty; a one-shot timer flushes the latest batch per nexthop to
/// the engine once the damped delay expires. A periodic tick decays the
/// penalty so a quiet system drifts back to the base delay.
pub struct NexthopTracker {
    server: Arc<dyn RouteServer>,
    delay: u32,
    /// One delay unit; tests shrink this
    pub(crate) unit: Duration,
    penalty: u32,
    is_scheduled: bool,
    scheduled: HashMap<String, PathList>,
    path_rx: mpsc::UnboundedReceiver<PathList>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: mpsc::Receiver<()>,
    timer: Option<JoinHandle<()>>,
    dead: watch::Receiver<()>,
}

impl NexthopTracker {
    pub fn new(
        server: Arc<dyn RouteServer>,
        delay: u8,
        dead: watch::Receiver<()>,
    ) -> (NexthopTracker, Nht) {
        let (path_tx, path_rx) = mpsc::unbounded_channel();
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let cache = Arc::new(Mutex::new(HashSet::new()));
        let tracker = NexthopTracker {
            server,
            delay: delay.into(),
            unit: Duration::from_secs(1),
            penalty: 0,
            is_scheduled: false,
            scheduled: HashMap::new(),
            path_rx,
            trigger_tx,
            trigger_rx,
            timer: None,
            dead,
        };
        let handle = Nht {
            cache,
            path_tx,
        };
        (tracker, handle)
    }

    /// Damping delay for the current penalty: the base delay until the
    /// threshold, then 8 more units per halving needed to get back
    /// under it.
    fn calculate_delay(&self, penalty: u32) -> u32 {
        if penalty <= PENALTY_THRESHOLD {
            return self.delay;
        }
        let mut delay = 8;
        let mut penalty = penalty;
        while penalty > PENALTY_THRESHOLD {
            delay += 8;
            penalty /= 2;
        }
        delay
    }

    /// Run until shutdown, releasing the decay ticker and any armed
    /// trigger timer on the way out.
    pub async fn run(mut self) {
        let mut decay = time::interval(self.unit * DECAY_TICK_UNITS);
        loop {
            tokio::select! {
                _ = self.dead.changed() => break,
                _ = decay.tick() => {
                    self.penalty /= 2;
                }
                paths = self.path_rx.recv() => match paths {
                    Some(paths) => self.handle_batch(paths),
                    None => break,
                },
                _ = self.trigger_rx.recv() => {
                    self.flush().await;
                }
            }
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn handle_batch(&mut self, paths: PathList) {
        self.penalty += PENALTY_STEP;
        trace!(
            "Nexthop tracking: penalty {} charged, now {}",
            PENALTY_STEP,
            self.penalty
        );
        self.append(paths);

        if self.is_scheduled {
            debug!("Nexthop tracking event already scheduled");
            return;
        }
        self.is_scheduled = true;

        let delay = self.calculate_delay(self.penalty);
        if let Some(stale) = self.timer.take() {
            stale.abort();
        }
        let trigger = self.trigger_tx.clone();
        let duration = self.unit * delay;
        self.timer = Some(tokio::spawn(async move {
            time::sleep(duration).await;
            let _ = trigger.send(()).await;
        }));
        debug!("Nexthop tracking event scheduled in {} units", delay);
    }

    /// Latest batch wins per nexthop
    fn append(&mut self, paths: PathList) {
        let nexthop = match paths.first() {
            Some(path) => path.nexthop.to_string(),
            None => return,
        };
        self.scheduled.insert(nexthop, paths);
    }

    async fn flush(&mut self) {
        let paths: PathList = self.scheduled.drain().flat_map(|(_, list)| list).collect();
        debug!("Updating nexthop reachability for {} paths", paths.len());
        if let Err(err) = self.server.update_path(paths).await {
            // No retry; the next reachability event re-triggers
            error!("Failed to update nexthop reachability: {}", err);
        }
        self.is_scheduled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockServer;
    use crate::path::{Family, Nlri, Path};

    fn test_path(prefix: &str, nexthop: &str) -> Arc<Path> {
        Arc::new(Path::new(
            Nlri::new(prefix.parse().unwrap()),
            Family::ipv4_unicast(),
            nexthop.parse().unwrap(),
        ))
    }

    fn spawn_tracker(
        server: Arc<MockServer>,
        delay: u8,
    ) -> (Nht, watch::Sender<()>) {
        let (dead_tx, dead_rx) = watch::channel(());
        let (mut tracker, handle) = NexthopTracker::new(server, delay, dead_rx);
        tracker.unit = Duration::from_millis(10);
        tokio::spawn(tracker.run());
        (handle, dead_tx)
    }

    #[test]
    fn test_register_idempotence() {
        let (path_tx, _path_rx) = mpsc::unbounded_channel();
        let handle = Nht {
            cache: Arc::new(Mutex::new(HashSet::new())),
            path_tx,
        };
        let nexthop: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(handle.register(nexthop));
        assert!(!handle.register(nexthop));
        assert!(handle.is_registered(&nexthop));
        handle.unregister(&nexthop);
        assert!(!handle.is_registered(&nexthop));
    }

    #[tokio::test]
    async fn test_delay_policy() {
        let server = Arc::new(MockServer::new());
        let (_dead_tx, dead_rx) = watch::channel(());
        let (tracker, _handle) =
            NexthopTracker::new(server as Arc<dyn RouteServer>, 1, dead_rx);
        // Below the threshold the configured base delay holds
        assert_eq!(tracker.calculate_delay(0), 1);
        assert_eq!(tracker.calculate_delay(950), 1);
        // One halving gets 951 under the threshold
        assert_eq!(tracker.calculate_delay(951), 16);
        assert_eq!(tracker.calculate_delay(1900), 16);
        // Two halvings for 3800
        assert_eq!(tracker.calculate_delay(3800), 24);
    }

    #[tokio::test]
    async fn test_damping_monotonic() {
        let server = Arc::new(MockServer::new());
        let (_dead_tx, dead_rx) = watch::channel(());
        let (tracker, _handle) =
            NexthopTracker::new(server as Arc<dyn RouteServer>, 1, dead_rx);
        // Successive batches without decay: delay never shrinks
        let mut last = 0;
        for submissions in 1..=10u32 {
            let delay = tracker.calculate_delay(submissions * PENALTY_STEP);
            assert!(delay >= last);
            last = delay;
        }
        assert!(last > tracker.delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalescing() {
        let server = Arc::new(MockServer::new());
        let (handle, _dead_tx) = spawn_tracker(server.clone(), 1);

        // Three batches for the same nexthop inside one timer window
        for metric in 0..3u32 {
            let mut path = (*test_path("10.0.0.0/24", "192.0.2.1")).clone();
            path.med = Some(metric);
            handle.schedule(vec![Arc::new(path)]);
        }
        time::sleep(Duration::from_millis(500)).await;

        // Exactly one engine submission, carrying only the latest batch
        let updates = server.updated.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].len(), 1);
        assert_eq!(updates[0][0].med, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_across_nexthops() {
        let server = Arc::new(MockServer::new());
        let (handle, _dead_tx) = spawn_tracker(server.clone(), 1);

        handle.schedule(vec![test_path("10.0.0.0/24", "192.0.2.1")]);
        handle.schedule(vec![test_path("10.0.1.0/24", "192.0.2.2")]);
        time::sleep(Duration::from_millis(500)).await;

        // One trigger flushes the map across nexthops
        let updates = server.updated.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrigger_after_flush() {
        let server = Arc::new(MockServer::new());
        let (handle, _dead_tx) = spawn_tracker(server.clone(), 1);

        handle.schedule(vec![test_path("10.0.0.0/24", "192.0.2.1")]);
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.update_count(), 1);

        // A batch after the flush arms a fresh timer
        handle.schedule(vec![test_path("10.0.1.0/24", "192.0.2.2")]);
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.update_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_rejection_logged_not_retried() {
        let server = Arc::new(MockServer::new());
        *server.reject_updates.lock().unwrap() = true;
        let (handle, _dead_tx) = spawn_tracker(server.clone(), 1);

        handle.schedule(vec![test_path("10.0.0.0/24", "192.0.2.1")]);
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.update_count(), 0);

        // The next event still goes through the normal schedule path
        *server.reject_updates.lock().unwrap() = false;
        handle.schedule(vec![test_path("10.0.0.0/24", "192.0.2.1")]);
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.update_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_paths_to_register() {
        let server = Arc::new(MockServer::new());
        let (handle, _dead_tx) = spawn_tracker(server, 1);

        let active = test_path("10.0.0.0/24", "192.0.2.1");
        let mut withdrawn = (*test_path("10.0.1.0/24", "192.0.2.2")).clone();
        withdrawn.is_withdraw = true;
        let mut external = (*test_path("10.0.2.0/24", "192.0.2.3")).clone();
        external.from_external = true;
        let unspecified = test_path("10.0.3.0/24", "0.0.0.0");

        let filtered = handle.filter_paths_to_register(&[
            active.clone(),
            Arc::new(withdrawn),
            Arc::new(external),
            unspecified,
        ]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].nexthop, active.nexthop);

        // Already-registered nexthops drop out too
        handle.register(active.nexthop);
        assert!(handle.filter_paths_to_register(&[active]).is_empty());
    }
}
