pub mod translate;

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::BridgeConfig;
use crate::engine::{RouteServer, WatchEvent, WatchEventTx, WatchOptions};
use crate::nht::{NexthopTracker, Nht};
use crate::path::{Path, PathList};
use crate::zserv::{Body, Message, RouteType, ZservClient, VRF_DEFAULT};

/// Cadence of session reopen attempts after a connection loss
const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub enum BridgeError {
    /// The RIB daemon url is not of the form scheme:address. [url]
    InvalidUrl(String),
    /// A redistribute protocol name is not recognized. [name]
    UnknownProtocol(String),
    /// Transport failure while opening the session. [source]
    Io(io::Error),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use BridgeError::*;
        match self {
            InvalidUrl(url) => write!(f, "Unsupported RIB daemon url: '{}'", url),
            UnknownProtocol(name) => write!(f, "Unknown redistribute protocol: '{}'", name),
            Io(err) => write!(f, "RIB daemon session error: {}", err),
        }
    }
}

impl error::Error for BridgeError {}

impl From<io::Error> for BridgeError {
    fn from(error: io::Error) -> Self {
        BridgeError::Io(error)
    }
}

fn parse_url(url: &str) -> Result<(&str, &str), BridgeError> {
    let mut parts = url.splitn(2, ':');
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(addr)) if !scheme.is_empty() && !addr.is_empty() => {
            Ok((scheme, addr))
        }
        _ => Err(BridgeError::InvalidUrl(url.to_string())),
    }
}

/// Running bridge session. Dropping the handle (or calling
/// [`BridgeHandle::stop`]) signals every loop to exit at its next
/// suspension point.
pub struct BridgeHandle {
    shutdown: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// Signal shutdown and wait for the event loop to wind down
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// The bridge between the BGP engine and the RIB daemon: one
/// cooperative loop multiplexing daemon messages, engine watch events
/// and shutdown.
pub struct Bridge {
    client: ZservClient,
    server: Arc<dyn RouteServer>,
    nht: Option<Nht>,
    config: BridgeConfig,
    dead: watch::Receiver<()>,
    // Dropping this stops the tracker spawned for this session
    _nht_shutdown: Option<watch::Sender<()>>,
}

impl Bridge {
    /// Open a session against the RIB daemon, subscribe to interface
    /// and redistribution events, and start the event loop.
    pub async fn open(
        config: BridgeConfig,
        server: Arc<dyn RouteServer>,
    ) -> Result<BridgeHandle, BridgeError> {
        let (shutdown, dead) = watch::channel(());
        let bridge = Bridge::connect(&config, server, dead).await?;
        let task = tokio::spawn(bridge.run());
        Ok(BridgeHandle { shutdown, task })
    }

    async fn connect(
        config: &BridgeConfig,
        server: Arc<dyn RouteServer>,
        dead: watch::Receiver<()>,
    ) -> Result<Bridge, BridgeError> {
        let (scheme, addr) = parse_url(&config.url)?;
        let mut client =
            ZservClient::connect(scheme, addr, RouteType::Bgp, &[config.version]).await?;
        client.send_interface_add().await?;
        for name in &config.redistribute {
            let route_type: RouteType = name
                .parse()
                .map_err(|_| BridgeError::UnknownProtocol(name.clone()))?;
            client.send_redistribute(route_type).await?;
        }
        let (nht, nht_shutdown) = if config.nht {
            let (tx, rx) = watch::channel(());
            let (tracker, handle) = NexthopTracker::new(server.clone(), config.nht_delay, rx);
            tokio::spawn(tracker.run());
            (Some(handle), Some(tx))
        } else {
            (None, None)
        };
        Ok(Bridge {
            client,
            server,
            nht,
            config: config.clone(),
            dead,
            _nht_shutdown: nht_shutdown,
        })
    }

    fn run(mut self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut watcher = self.server.watch(WatchOptions {
                best_path: true,
                post_update: true,
            });

            // Replay current state so the RIB daemon catches up
            let replay = watcher.sender();
            let replay_server = self.server.clone();
            tokio::spawn(async move { replay_vrf_routes(replay_server, replay).await });

            // Make non-default VRFs known on the link
            for vrf in self.server.vrfs().await {
                if vrf.id != 0 {
                    if let Err(err) = self.client.send_vrf_register(vrf.id.into()).await {
                        warn!("Failed to register VRF {}: {}", vrf.id, err);
                    }
                }
            }

            let mut dead = self.dead.clone();
            loop {
                tokio::select! {
                    _ = dead.changed() => {
                        debug!("Bridge loop shutting down");
                        return;
                    }
                    message = self.client.recv() => match message {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            warn!("RIB daemon session lost, scheduling reconnect");
                            let config = self.config.clone();
                            let server = self.server.clone();
                            let dead = self.dead.clone();
                            tokio::spawn(async move { reconnect(config, server, dead).await });
                            return;
                        }
                    },
                    event = watcher.event() => match event {
                        Some(event) => self.handle_watch_event(event).await,
                        None => return,
                    },
                }
            }
        })
    }

    async fn handle_message(&mut self, message: Message) {
        match &message.body {
            Body::Route(body) => {
                if let Some(path) = translate::path_from_route(&message.header, body) {
                    if let Err(err) = self.server.add_path(vec![Arc::new(path)]).await {
                        error!("Failed to add path from RIB daemon: {}", err);
                    }
                }
            }
            Body::NexthopUpdate(body) => {
                let nht = match self.nht.clone() {
                    Some(nht) => nht,
                    None => return,
                };
                // Transient view of the RIB across the affected families
                let mut bound: PathList = Vec::new();
                for family in translate::families_for_af(body.family) {
                    match self.server.rib_snapshot(family).await {
                        Ok(paths) => bound.extend(
                            paths.into_iter().filter(|path| path.nexthop == body.prefix),
                        ),
                        Err(err) => {
                            error!("Failed to get RIB for family {}: {}", family, err);
                        }
                    }
                }
                let (updated, unregister) =
                    translate::paths_from_nexthop_update(body, bound, &nht);
                nht.schedule(updated);
                if let Some(unregister) = unregister {
                    // Nothing is bound anymore; the daemon stops
                    // tracking this nexthop
                    if let Err(err) = self
                        .client
                        .send_nexthop_unregister(message.header.vrf_id, unregister)
                        .await
                    {
                        warn!("Failed to send nexthop unregister: {}", err);
                    }
                }
            }
            _ => trace!("Ignoring {} message", message.header.command),
        }
    }

    async fn handle_watch_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::BestPath {
                paths,
                multipath,
                vrf,
            } => {
                if !multipath.is_empty() {
                    for group in multipath {
                        self.send_batch(VRF_DEFAULT, &group, false).await;
                    }
                    return;
                }
                for path in paths {
                    if path.nlri.is_default() {
                        // Default routes go out on the postupdate edge
                        continue;
                    }
                    let self_route_withdraw = path.local;
                    if self_route_withdraw {
                        debug!("Forcing local path to self-withdraw: {}", path.nlri);
                    }
                    let mut vrf_ids = Vec::new();
                    if let Some(id) = vrf.get(&path.nlri.to_string()) {
                        vrf_ids.push(*id);
                    }
                    if vrf_ids.is_empty() {
                        vrf_ids.push(VRF_DEFAULT);
                    }
                    let batch = vec![path];
                    for vrf_id in vrf_ids {
                        self.send_batch(vrf_id, &batch, self_route_withdraw).await;
                    }
                }
            }
            WatchEvent::PostUpdate { paths, mut vrf } => {
                if vrf.is_empty() {
                    // Resolve VPN paths against the configured VRFs
                    for path in &paths {
                        if path.family.is_vpn() {
                            for candidate in self.server.vrfs().await {
                                if candidate.id != 0 && candidate.can_import(path) {
                                    vrf.insert(path.nlri.to_string(), candidate.id);
                                }
                            }
                        }
                    }
                }
                for path in paths {
                    // Only default routes and VPN paths leave on this
                    // edge; everything else rides the bestpath stream
                    if !path.nlri.is_default() && !path.family.is_vpn() {
                        continue;
                    }
                    if path.local {
                        debug!("Skipping local path {}", path.nlri);
                        continue;
                    }
                    let mut vrf_ids = Vec::new();
                    if let Some(id) = vrf.get(&path.nlri.to_string()) {
                        vrf_ids.push(*id);
                    }
                    if vrf_ids.is_empty() {
                        for candidate in self.server.vrfs().await {
                            match (path.nlri.rd, candidate.rd) {
                                (Some(path_rd), Some(vrf_rd)) if path_rd == vrf_rd => {
                                    vrf_ids.push(candidate.id);
                                }
                                _ => (),
                            }
                        }
                    }
                    if vrf_ids.is_empty() {
                        vrf_ids.push(VRF_DEFAULT);
                    }
                    let batch = vec![path];
                    for vrf_id in vrf_ids {
                        self.send_batch(vrf_id, &batch, false).await;
                    }
                }
            }
        }
    }

    /// Emit the route message and nexthop registration for one batch
    async fn send_batch(&mut self, vrf_id: u16, batch: &[Arc<Path>], self_route_withdraw: bool) {
        if let Some((body, mut is_withdraw)) = translate::route_body(batch, self_route_withdraw) {
            if self_route_withdraw {
                is_withdraw = true;
            }
            if let Err(err) = self.client.send_route(vrf_id, body, is_withdraw).await {
                warn!("Failed to send route message: {}", err);
            }
        }
        let (body, mut is_withdraw) = translate::nexthop_register_body(batch, self.nht.as_ref());
        if let Some(body) = body {
            if self_route_withdraw {
                is_withdraw = true;
            }
            if let Err(err) = self
                .client
                .send_nexthop_register(vrf_id, body, is_withdraw)
                .await
            {
                warn!("Failed to send nexthop register: {}", err);
            }
        }
    }
}

/// Push every VRF's known paths through the watcher's own channel so
/// startup state reaches the RIB daemon. Both event flavors are sent;
/// consumers tolerate either ordering.
async fn replay_vrf_routes(server: Arc<dyn RouteServer>, replay: WatchEventTx) {
    for vrf in server.vrfs().await {
        let destinations = match server.vrf_destinations(&vrf.name).await {
            Some(destinations) => destinations,
            None => continue,
        };
        for paths in destinations {
            let mut vrf_map = HashMap::new();
            for path in &paths {
                vrf_map.insert(path.nlri.to_string(), vrf.id);
            }
            let _ = replay.send(WatchEvent::PostUpdate {
                paths: paths.clone(),
                vrf: vrf_map.clone(),
            });
            let _ = replay.send(WatchEvent::BestPath {
                paths,
                multipath: vec![],
                vrf: vrf_map,
            });
        }
    }
}

/// Keep retrying the session until it opens or shutdown is signalled
async fn reconnect(
    config: BridgeConfig,
    server: Arc<dyn RouteServer>,
    mut dead: watch::Receiver<()>,
) {
    info!(
        "Retrying RIB daemon session every {} seconds",
        RECONNECT_INTERVAL.as_secs()
    );
    loop {
        tokio::select! {
            _ = dead.changed() => return,
            _ = time::sleep(RECONNECT_INTERVAL) => {}
        }
        match Bridge::connect(&config, server.clone(), dead.clone()).await {
            Ok(bridge) => {
                info!("RIB daemon session re-established");
                tokio::spawn(bridge.run());
                return;
            }
            Err(err) => debug!("Session reopen failed: {}", err),
        }
    }
}
