use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use super::config::GossipConfig;
use super::error::GossipError;
use super::state::{Delta, Digest, KeyState};
use super::{Gossiper, GossipWatcher};

/// Identity and gossip address of a cluster peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Stable logical node identifier.
    pub id: String,
    /// Address the peer's gossip transport is reachable at.
    pub gossip_addr: SocketAddr,
}

/// Failure-detector state of a tracked peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Peer is responding to probes.
    Alive,
    /// Peer failed a probe and is under suspicion.
    Suspect,
    /// Peer exceeded the suspicion timeout.
    Dead,
    /// Peer announced a voluntary departure.
    Left,
}

impl PeerState {
    const fn is_probe_candidate(self) -> bool {
        matches!(self, Self::Alive | Self::Suspect)
    }
}

// At equal incarnations the "worse" state wins so departures and failures
// cannot be shadowed by stale alive rumors.
const fn precedence(state: PeerState) -> u8 {
    match state {
        PeerState::Alive => 0,
        PeerState::Suspect => 1,
        PeerState::Dead => 2,
        PeerState::Left => 3,
    }
}

/// Membership rumor disseminated between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rumor {
    /// Peer the rumor describes.
    pub peer: PeerInfo,
    /// Reported failure-detector state.
    pub state: PeerState,
    /// Incarnation counter the report was made at.
    pub incarnation: u64,
}

/// Gossip messages exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Direct probe. Carries the sender's digest of all known state so the
    /// responder can push back what the sender is missing.
    Ping {
        /// Probing node.
        from: PeerInfo,
        /// Prober's incarnation counter.
        incarnation: u64,
        /// Recently observed membership rumors.
        rumors: Vec<Rumor>,
        /// High-water versions of every node state the sender holds.
        digests: Vec<Digest>,
    },
    /// Probe acknowledgment, also used as the push half of anti-entropy.
    Ack {
        /// Responding node (or probed target, when relayed).
        from: PeerInfo,
        /// Responder's incarnation counter.
        incarnation: u64,
        /// Recently observed membership rumors.
        rumors: Vec<Rumor>,
        /// Key updates the probing node was missing.
        deltas: Vec<Delta>,
    },
    /// Request to probe `target` on behalf of `from`.
    PingReq {
        /// Requesting node.
        from: PeerInfo,
        /// Node to probe indirectly.
        target: PeerInfo,
        /// Requester's incarnation counter.
        incarnation: u64,
        /// Recently observed membership rumors.
        rumors: Vec<Rumor>,
    },
    /// Unsolicited dissemination of rumors and key updates.
    Broadcast {
        /// Membership rumors.
        rumors: Vec<Rumor>,
        /// Key updates.
        deltas: Vec<Delta>,
    },
}

/// Aggregate peer counts for diagnostics. Unconfirmed seed placeholders are
/// not counted.
#[derive(Debug, Clone, Copy, Default)]
pub struct GossipStats {
    /// Peers responding to probes.
    pub alive: usize,
    /// Peers under suspicion.
    pub suspect: usize,
    /// Peers past the suspicion timeout.
    pub dead: usize,
    /// Peers that announced departure.
    pub left: usize,
}

impl GossipStats {
    /// Total tracked peers.
    #[must_use]
    pub const fn total(self) -> usize {
        self.alive + self.suspect + self.dead + self.left
    }
}

struct Peer {
    info: PeerInfo,
    state: PeerState,
    incarnation: u64,
    keys: KeyState,
    last_update: Instant,
    suspect_deadline: Option<Instant>,
    expire_deadline: Option<Instant>,
    // Seed entries known only by address. Placeholders are probed but never
    // surfaced to the watcher; they are replaced once the real id is learned.
    placeholder: bool,
}

impl Peer {
    fn alive(info: PeerInfo, incarnation: u64, now: Instant) -> Self {
        Self {
            info,
            state: PeerState::Alive,
            incarnation,
            keys: KeyState::new(),
            last_update: now,
            suspect_deadline: None,
            expire_deadline: None,
            placeholder: false,
        }
    }

    fn seed_placeholder(info: PeerInfo, now: Instant) -> Self {
        Self {
            placeholder: true,
            ..Self::alive(info, 0, now)
        }
    }

    fn rumor(&self) -> Rumor {
        Rumor {
            peer: self.info.clone(),
            state: self.state,
            incarnation: self.incarnation,
        }
    }
}

enum WatcherEvent {
    Join(String),
    Leave(String),
    Down(String),
    Healthy(String),
    Expired(String),
    UpsertKey {
        node: String,
        key: String,
        value: String,
    },
    DeleteKey {
        node: String,
        key: String,
    },
}

struct ProbePlan {
    target: PeerInfo,
    relays: Vec<PeerInfo>,
}

/// SWIM-like gossip engine.
///
/// Combines a probe-based failure detector with anti-entropy dissemination of
/// each node's versioned key/value state. Watcher callbacks are dispatched
/// one at a time, after every internal lock has been released.
pub struct GossipEngine {
    local: PeerInfo,
    config: GossipConfig,
    socket: UdpSocket,
    watcher: Arc<dyn GossipWatcher>,
    incarnation: AtomicU64,
    local_state: Mutex<KeyState>,
    outbox: Mutex<VecDeque<Delta>>,
    peers: DashMap<String, Peer>,
    pending_probes: DashMap<String, oneshot::Sender<u64>>,
    rng: Mutex<SmallRng>,
    dispatch: Mutex<()>,
}

impl GossipEngine {
    /// Binds the gossip socket and launches the engine's background tasks.
    ///
    /// `advertise_addr` is the address peers should contact this node at; it
    /// defaults to the bound address, which the caller must ensure is
    /// reachable (an unspecified bind host has to be translated first).
    pub async fn spawn(
        id: impl Into<String>,
        bind_addr: SocketAddr,
        advertise_addr: Option<SocketAddr>,
        config: GossipConfig,
        watcher: Arc<dyn GossipWatcher>,
    ) -> Result<(Arc<Self>, GossipHandle), GossipError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let advertise = match advertise_addr {
            Some(addr) => addr,
            None => socket.local_addr()?,
        };
        let local = PeerInfo {
            id: id.into(),
            gossip_addr: advertise,
        };
        let engine = Arc::new(Self::new(local, config, watcher, socket));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(Self::probe_loop(Arc::clone(&engine), shutdown_rx.clone())),
            tokio::spawn(Self::recv_loop(Arc::clone(&engine), shutdown_rx.clone())),
            tokio::spawn(Self::reap_loop(Arc::clone(&engine), shutdown_rx.clone())),
            tokio::spawn(Self::flush_loop(Arc::clone(&engine), shutdown_rx)),
        ];
        Ok((engine, GossipHandle { shutdown_tx, tasks }))
    }

    fn new(
        local: PeerInfo,
        config: GossipConfig,
        watcher: Arc<dyn GossipWatcher>,
        socket: UdpSocket,
    ) -> Self {
        Self {
            local,
            config,
            socket,
            watcher,
            incarnation: AtomicU64::new(0),
            local_state: Mutex::new(KeyState::new()),
            outbox: Mutex::new(VecDeque::new()),
            peers: DashMap::new(),
            pending_probes: DashMap::new(),
            rng: Mutex::new(SmallRng::from_entropy()),
            dispatch: Mutex::new(()),
        }
    }

    /// Identity this engine advertises to peers.
    #[must_use]
    pub const fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    /// Address the gossip socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, GossipError> {
        Ok(self.socket.local_addr()?)
    }

    /// Aggregate peer counts for diagnostics.
    #[must_use]
    pub fn stats(&self) -> GossipStats {
        let mut stats = GossipStats::default();
        for entry in &self.peers {
            if entry.value().placeholder {
                continue;
            }
            match entry.value().state {
                PeerState::Alive => stats.alive += 1,
                PeerState::Suspect => stats.suspect += 1,
                PeerState::Dead => stats.dead += 1,
                PeerState::Left => stats.left += 1,
            }
        }
        stats
    }

    /// Contacts the given seed addresses. Unknown seeds are tracked as
    /// placeholders until their real identity is learned from a response.
    pub async fn join(&self, seeds: &[SocketAddr]) {
        let now = Instant::now();
        for seed in seeds {
            if *seed == self.local.gossip_addr {
                continue;
            }
            let info = PeerInfo {
                id: seed.to_string(),
                gossip_addr: *seed,
            };
            self.peers
                .entry(info.id.clone())
                .or_insert_with(|| Peer::seed_placeholder(info.clone(), now));
            if let Err(err) = self.send_ping(&info).await {
                warn!(seed = %seed, "failed to contact seed: {err}");
            }
        }
    }

    /// Announces a voluntary departure to every reachable peer. Callers
    /// should allow some propagation time before stopping the engine.
    pub async fn leave(&self) {
        let incarnation = self.incarnation.fetch_add(1, Ordering::AcqRel) + 1;
        let message = GossipMessage::Broadcast {
            rumors: vec![Rumor {
                peer: self.local.clone(),
                state: PeerState::Left,
                incarnation,
            }],
            deltas: Vec::new(),
        };
        let targets: Vec<(String, SocketAddr)> = self
            .peers
            .iter()
            .filter(|entry| entry.value().state == PeerState::Alive)
            .map(|entry| (entry.key().clone(), entry.value().info.gossip_addr))
            .collect();
        for (id, addr) in targets {
            if let Err(err) = self.transmit(&message, addr).await {
                debug!(peer = %id, "failed to announce leave: {err}");
            }
        }
    }

    async fn probe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.config.probe_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_probe_cycle().await {
                        warn!("probe cycle failed: {err}");
                    }
                }
            }
        }
    }

    async fn recv_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; self.config.max_packet_size];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = match received {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!("gossip recv error: {err}");
                            continue;
                        }
                    };
                    match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                        Ok(message) => {
                            if let Err(err) = self.handle_message(message).await {
                                warn!("failed to handle gossip message: {err}");
                            }
                        }
                        // Stray or truncated datagrams are not worth a warning.
                        Err(err) => debug!(peer = %addr, "dropping undecodable packet: {err}"),
                    }
                }
            }
        }
    }

    async fn reap_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = (self.config.suspicion_timeout.min(self.config.expiry_timeout) / 2)
            .max(Duration::from_millis(50));
        let mut ticker = time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let rumors = self.reap(Instant::now());
                    if !rumors.is_empty() {
                        self.broadcast_rumors(rumors).await;
                    }
                }
            }
        }
    }

    async fn flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = (self.config.probe_interval / 2).max(Duration::from_millis(50));
        let mut ticker = time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.flush_outbox().await,
            }
        }
    }

    async fn run_probe_cycle(self: &Arc<Self>) -> Result<(), GossipError> {
        let Some(plan) = self.plan_probe() else {
            return Ok(());
        };
        trace!(peer = %plan.target.id, "probing peer");
        if self.probe_direct(&plan.target).await?.is_some() {
            return Ok(());
        }

        if !plan.relays.is_empty() {
            for relay in &plan.relays {
                self.send_ping_req(relay, &plan.target).await?;
            }
            if self.await_ack(&plan.target.id).await.is_some() {
                return Ok(());
            }
        }

        self.record_probe_failure(&plan.target.id, Instant::now());
        Ok(())
    }

    fn plan_probe(&self) -> Option<ProbePlan> {
        let mut candidates: Vec<PeerInfo> = self
            .peers
            .iter()
            .filter(|entry| entry.value().state.is_probe_candidate())
            .map(|entry| entry.value().info.clone())
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let mut rng = self.rng.lock();
        candidates.shuffle(&mut *rng);
        let target = candidates.pop()?;
        let mut relays: Vec<PeerInfo> = self
            .peers
            .iter()
            .filter(|entry| {
                entry.value().state == PeerState::Alive && entry.value().info.id != target.id
            })
            .map(|entry| entry.value().info.clone())
            .collect();
        relays.shuffle(&mut *rng);
        relays.truncate(self.config.indirect_probes);
        drop(rng);

        Some(ProbePlan { target, relays })
    }

    async fn probe_direct(&self, target: &PeerInfo) -> Result<Option<u64>, GossipError> {
        let receiver = self.register_probe(&target.id);
        self.send_ping(target).await?;
        Ok(self.await_probe(&target.id, receiver).await)
    }

    fn register_probe(&self, id: &str) -> oneshot::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        self.pending_probes.insert(id.to_string(), tx);
        rx
    }

    async fn await_probe(&self, id: &str, receiver: oneshot::Receiver<u64>) -> Option<u64> {
        match time::timeout(self.config.ack_timeout, receiver).await {
            Ok(Ok(incarnation)) => Some(incarnation),
            _ => {
                self.pending_probes.remove(id);
                None
            }
        }
    }

    async fn await_ack(&self, id: &str) -> Option<u64> {
        let receiver = self.register_probe(id);
        self.await_probe(id, receiver).await
    }

    fn complete_probe(&self, id: &str, incarnation: u64) {
        if let Some((_, sender)) = self.pending_probes.remove(id) {
            let _ = sender.send(incarnation);
        }
    }

    fn record_probe_failure(&self, id: &str, now: Instant) {
        let mut events = Vec::new();
        {
            let Some(mut entry) = self.peers.get_mut(id) else {
                return;
            };
            let peer = entry.value_mut();
            match peer.state {
                PeerState::Alive => {
                    peer.state = PeerState::Suspect;
                    peer.suspect_deadline = Some(now + self.config.suspicion_timeout);
                    peer.last_update = now;
                    if !peer.placeholder {
                        events.push(WatcherEvent::Down(id.to_string()));
                    }
                }
                PeerState::Suspect => {
                    if peer
                        .suspect_deadline
                        .is_some_and(|deadline| deadline <= now)
                    {
                        peer.state = PeerState::Dead;
                        peer.expire_deadline = Some(now + self.config.expiry_timeout);
                        peer.last_update = now;
                    }
                }
                PeerState::Dead | PeerState::Left => {}
            }
        }
        self.notify(events);
    }

    // Escalates overdue suspects to dead and forgets peers past the expiry
    // timeout. Returns rumors describing the escalations.
    fn reap(&self, now: Instant) -> Vec<Rumor> {
        let mut rumors = Vec::new();
        let mut events = Vec::new();
        let mut expired = Vec::new();
        for mut entry in self.peers.iter_mut() {
            let peer = entry.value_mut();
            if peer.state == PeerState::Suspect
                && peer
                    .suspect_deadline
                    .is_some_and(|deadline| deadline <= now)
            {
                peer.state = PeerState::Dead;
                peer.expire_deadline = Some(now + self.config.expiry_timeout);
                peer.last_update = now;
                rumors.push(peer.rumor());
            }
            if matches!(peer.state, PeerState::Dead | PeerState::Left)
                && peer
                    .expire_deadline
                    .is_some_and(|deadline| deadline <= now)
            {
                expired.push(entry.key().clone());
            }
        }
        for id in expired {
            if let Some((_, peer)) = self.peers.remove(&id) {
                debug!(peer = %id, "forgetting expired peer");
                if !peer.placeholder {
                    events.push(WatcherEvent::Expired(id));
                }
            }
        }
        self.notify(events);
        rumors
    }

    pub(crate) async fn handle_message(
        self: &Arc<Self>,
        message: GossipMessage,
    ) -> Result<(), GossipError> {
        let now = Instant::now();
        match message {
            GossipMessage::Ping {
                from,
                incarnation,
                rumors,
                digests,
            } => {
                trace!(peer = %from.id, "received ping");
                let mut events = self.observe_peer(&from, incarnation, now);
                events.extend(self.apply_rumors(&rumors, now));
                self.notify(events);

                let reply = GossipMessage::Ack {
                    from: self.local.clone(),
                    incarnation: self.incarnation.load(Ordering::Acquire),
                    rumors: self.collect_rumors(),
                    deltas: self.updates_for(&digests),
                };
                self.transmit(&reply, from.gossip_addr).await?;
            }
            GossipMessage::Ack {
                from,
                incarnation,
                rumors,
                deltas,
            } => {
                trace!(peer = %from.id, "received ack");
                let mut events = self.observe_peer(&from, incarnation, now);
                events.extend(self.apply_rumors(&rumors, now));
                events.extend(self.apply_updates(&deltas));
                self.notify(events);
                self.complete_probe(&from.id, incarnation);
            }
            GossipMessage::PingReq {
                from,
                target,
                incarnation,
                rumors,
            } => {
                let mut events = self.observe_peer(&from, incarnation, now);
                events.extend(self.apply_rumors(&rumors, now));
                self.notify(events);

                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = engine.relay_probe(from, target).await {
                        debug!("relayed probe failed: {err}");
                    }
                });
            }
            GossipMessage::Broadcast { rumors, deltas } => {
                let mut events = self.apply_rumors(&rumors, now);
                events.extend(self.apply_updates(&deltas));
                self.notify(events);
            }
        }
        Ok(())
    }

    async fn relay_probe(
        self: Arc<Self>,
        requester: PeerInfo,
        target: PeerInfo,
    ) -> Result<(), GossipError> {
        trace!(from = %requester.id, target = %target.id, "handling indirect probe");
        if let Some(incarnation) = self.probe_direct(&target).await? {
            let message = GossipMessage::Ack {
                from: target,
                incarnation,
                rumors: self.collect_rumors(),
                deltas: Vec::new(),
            };
            self.transmit(&message, requester.gossip_addr).await?;
        }
        Ok(())
    }

    // Marks the sender of a message alive. Direct contact is authoritative
    // regardless of whatever rumors said about the peer.
    fn observe_peer(&self, info: &PeerInfo, incarnation: u64, now: Instant) -> Vec<WatcherEvent> {
        if info.id == self.local.id {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.relabel_placeholder(info);
        match self.peers.entry(info.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let peer = occupied.get_mut();
                // A departed peer has to come back with a higher incarnation;
                // in-flight messages sent around its own leave announcement
                // must not revive it.
                if peer.state == PeerState::Left && incarnation <= peer.incarnation {
                    return events;
                }
                let was = peer.state;
                let was_placeholder = peer.placeholder;
                peer.placeholder = false;
                peer.info = info.clone();
                peer.incarnation = peer.incarnation.max(incarnation);
                peer.state = PeerState::Alive;
                peer.last_update = now;
                peer.suspect_deadline = None;
                peer.expire_deadline = None;
                if was_placeholder {
                    events.push(WatcherEvent::Join(info.id.clone()));
                } else {
                    push_transition_events(was, PeerState::Alive, &info.id, &mut events);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Peer::alive(info.clone(), incarnation, now));
                events.push(WatcherEvent::Join(info.id.clone()));
            }
        }
        events
    }

    fn apply_rumors(&self, rumors: &[Rumor], now: Instant) -> Vec<WatcherEvent> {
        let mut events = Vec::new();
        for rumor in rumors {
            if rumor.peer.id == self.local.id {
                // Refute anything but alive by outliving the rumor.
                if rumor.state != PeerState::Alive {
                    let current = self.incarnation.load(Ordering::Acquire);
                    if rumor.incarnation >= current {
                        self.incarnation
                            .store(rumor.incarnation + 1, Ordering::Release);
                    }
                }
                continue;
            }
            self.merge_rumor(rumor, now, &mut events);
        }
        events
    }

    fn merge_rumor(&self, rumor: &Rumor, now: Instant, events: &mut Vec<WatcherEvent>) {
        self.relabel_placeholder(&rumor.peer);
        match self.peers.entry(rumor.peer.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let peer = occupied.get_mut();
                let newer = peer.placeholder
                    || rumor.incarnation > peer.incarnation
                    || (rumor.incarnation == peer.incarnation
                        && precedence(rumor.state) > precedence(peer.state));
                if !newer {
                    return;
                }
                let was = peer.state;
                let was_placeholder = peer.placeholder;
                peer.placeholder = false;
                peer.info = rumor.peer.clone();
                peer.incarnation = rumor.incarnation;
                peer.state = rumor.state;
                peer.last_update = now;
                peer.suspect_deadline = (rumor.state == PeerState::Suspect)
                    .then(|| now + self.config.suspicion_timeout);
                peer.expire_deadline = matches!(rumor.state, PeerState::Dead | PeerState::Left)
                    .then(|| now + self.config.expiry_timeout);
                if was_placeholder {
                    events.push(WatcherEvent::Join(rumor.peer.id.clone()));
                    push_transition_events(PeerState::Alive, rumor.state, &rumor.peer.id, events);
                } else {
                    push_transition_events(was, rumor.state, &rumor.peer.id, events);
                }
            }
            Entry::Vacant(vacant) => {
                // Departed peers we never tracked stay forgotten.
                if matches!(rumor.state, PeerState::Dead | PeerState::Left) {
                    return;
                }
                let mut peer = Peer::alive(rumor.peer.clone(), rumor.incarnation, now);
                peer.state = rumor.state;
                peer.suspect_deadline = (rumor.state == PeerState::Suspect)
                    .then(|| now + self.config.suspicion_timeout);
                vacant.insert(peer);
                events.push(WatcherEvent::Join(rumor.peer.id.clone()));
                push_transition_events(PeerState::Alive, rumor.state, &rumor.peer.id, events);
            }
        }
    }

    // Seed entries are tracked under their address until the first response
    // reveals the peer's real id; drop the stale record so both never coexist.
    fn relabel_placeholder(&self, info: &PeerInfo) {
        if self.peers.contains_key(&info.id) {
            return;
        }
        let stale = self.peers.iter().find_map(|entry| {
            (entry.value().placeholder
                && entry.value().info.gossip_addr == info.gossip_addr
                && entry.key() != &info.id)
                .then(|| entry.key().clone())
        });
        if let Some(id) = stale {
            self.peers.remove(&id);
        }
    }

    fn apply_updates(&self, deltas: &[Delta]) -> Vec<WatcherEvent> {
        let mut events = Vec::new();
        for delta in deltas {
            // Echoes of our own state must not loop back in.
            if delta.node == self.local.id {
                continue;
            }
            let Some(mut entry) = self.peers.get_mut(&delta.node) else {
                trace!(node = %delta.node, key = %delta.key, "dropping update for unknown peer");
                continue;
            };
            let peer = entry.value_mut();
            if peer.placeholder {
                continue;
            }
            if peer.keys.apply(&delta.key, delta.value.clone(), delta.version) {
                events.push(match &delta.value {
                    Some(value) => WatcherEvent::UpsertKey {
                        node: delta.node.clone(),
                        key: delta.key.clone(),
                        value: value.clone(),
                    },
                    None => WatcherEvent::DeleteKey {
                        node: delta.node.clone(),
                        key: delta.key.clone(),
                    },
                });
            }
        }
        events
    }

    fn collect_rumors(&self) -> Vec<Rumor> {
        let mut recent: Vec<(Instant, Rumor)> = self
            .peers
            .iter()
            .filter(|entry| !entry.value().placeholder)
            .map(|entry| (entry.value().last_update, entry.value().rumor()))
            .collect();
        recent.sort_unstable_by_key(|(last_update, _)| Reverse(*last_update));
        recent
            .into_iter()
            .take(self.config.gossip_batch)
            .map(|(_, rumor)| rumor)
            .collect()
    }

    fn digest_snapshot(&self) -> Vec<Digest> {
        let mut digests = Vec::with_capacity(self.peers.len() + 1);
        digests.push(Digest {
            node: self.local.id.clone(),
            version: self.local_state.lock().version(),
        });
        for entry in &self.peers {
            if entry.value().placeholder {
                continue;
            }
            digests.push(Digest {
                node: entry.key().clone(),
                version: entry.value().keys.version(),
            });
        }
        digests
    }

    // Key updates the sender of `digests` has not seen yet, local state first.
    fn updates_for(&self, digests: &[Digest]) -> Vec<Delta> {
        let limit = self.config.delta_batch;
        let known: HashMap<&str, u64> = digests
            .iter()
            .map(|digest| (digest.node.as_str(), digest.version))
            .collect();

        let mut deltas = Vec::new();
        {
            let state = self.local_state.lock();
            let since = known.get(self.local.id.as_str()).copied().unwrap_or(0);
            for (key, value, version) in state.updates_since(since, limit) {
                deltas.push(Delta {
                    node: self.local.id.clone(),
                    key,
                    value,
                    version,
                });
            }
        }
        for entry in &self.peers {
            if deltas.len() >= limit {
                break;
            }
            let peer = entry.value();
            if peer.placeholder {
                continue;
            }
            let since = known.get(entry.key().as_str()).copied().unwrap_or(0);
            for (key, value, version) in peer.keys.updates_since(since, limit - deltas.len()) {
                deltas.push(Delta {
                    node: entry.key().clone(),
                    key,
                    value,
                    version,
                });
            }
        }
        deltas
    }

    async fn send_ping(&self, target: &PeerInfo) -> Result<(), GossipError> {
        let message = GossipMessage::Ping {
            from: self.local.clone(),
            incarnation: self.incarnation.load(Ordering::Acquire),
            rumors: self.collect_rumors(),
            digests: self.digest_snapshot(),
        };
        self.transmit(&message, target.gossip_addr).await
    }

    async fn send_ping_req(&self, relay: &PeerInfo, target: &PeerInfo) -> Result<(), GossipError> {
        let message = GossipMessage::PingReq {
            from: self.local.clone(),
            target: target.clone(),
            incarnation: self.incarnation.load(Ordering::Acquire),
            rumors: self.collect_rumors(),
        };
        self.transmit(&message, relay.gossip_addr).await
    }

    // Everything rides single datagrams; rumor and delta batching is what
    // keeps payloads under the configured budget.
    async fn transmit(&self, message: &GossipMessage, to: SocketAddr) -> Result<(), GossipError> {
        let payload = bincode::serialize(message)?;
        if payload.len() > self.config.max_packet_size {
            return Err(GossipError::MessageTooLarge(payload.len()));
        }
        self.socket.send_to(&payload, to).await?;
        Ok(())
    }

    async fn flush_outbox(&self) {
        let deltas: Vec<Delta> = {
            let mut outbox = self.outbox.lock();
            if outbox.is_empty() {
                return;
            }
            let take = outbox.len().min(self.config.delta_batch);
            outbox.drain(..take).collect()
        };
        // Peers that miss the broadcast still pull the state via digests.
        let targets = self.random_peers(self.config.broadcast_fanout());
        if targets.is_empty() {
            return;
        }
        let message = GossipMessage::Broadcast {
            rumors: Vec::new(),
            deltas,
        };
        for peer in targets {
            if let Err(err) = self.transmit(&message, peer.gossip_addr).await {
                debug!(peer = %peer.id, "failed to broadcast state: {err}");
            }
        }
    }

    async fn broadcast_rumors(&self, rumors: Vec<Rumor>) {
        let targets = self.random_peers(self.config.broadcast_fanout());
        if targets.is_empty() {
            return;
        }
        let message = GossipMessage::Broadcast {
            rumors,
            deltas: Vec::new(),
        };
        for peer in targets {
            if let Err(err) = self.transmit(&message, peer.gossip_addr).await {
                debug!(peer = %peer.id, "failed to broadcast rumors: {err}");
            }
        }
    }

    fn random_peers(&self, max: usize) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .iter()
            .filter(|entry| entry.value().state == PeerState::Alive)
            .map(|entry| entry.value().info.clone())
            .collect();
        {
            let mut rng = self.rng.lock();
            peers.shuffle(&mut *rng);
        }
        peers.truncate(max);
        peers
    }

    fn notify(&self, events: Vec<WatcherEvent>) {
        if events.is_empty() {
            return;
        }
        let _serialized = self.dispatch.lock();
        for event in events {
            match event {
                WatcherEvent::Join(id) => self.watcher.on_join(&id),
                WatcherEvent::Leave(id) => self.watcher.on_leave(&id),
                WatcherEvent::Down(id) => self.watcher.on_down(&id),
                WatcherEvent::Healthy(id) => self.watcher.on_healthy(&id),
                WatcherEvent::Expired(id) => self.watcher.on_expired(&id),
                WatcherEvent::UpsertKey { node, key, value } => {
                    self.watcher.on_upsert_key(&node, &key, &value);
                }
                WatcherEvent::DeleteKey { node, key } => {
                    self.watcher.on_delete_key(&node, &key);
                }
            }
        }
    }
}

fn push_transition_events(
    from: PeerState,
    to: PeerState,
    id: &str,
    events: &mut Vec<WatcherEvent>,
) {
    if from == to {
        return;
    }
    match to {
        PeerState::Alive => {
            events.push(WatcherEvent::Healthy(id.to_string()));
        }
        PeerState::Suspect | PeerState::Dead => {
            if from == PeerState::Alive {
                events.push(WatcherEvent::Down(id.to_string()));
            }
        }
        PeerState::Left => {
            events.push(WatcherEvent::Leave(id.to_string()));
        }
    }
}

impl Gossiper for GossipEngine {
    fn upsert_local(&self, key: &str, value: &str) {
        let version = self.local_state.lock().upsert(key, value);
        self.outbox.lock().push_back(Delta {
            node: self.local.id.clone(),
            key: key.to_string(),
            value: Some(value.to_string()),
            version,
        });
    }

    fn delete_local(&self, key: &str) {
        let version = self.local_state.lock().delete(key);
        self.outbox.lock().push_back(Delta {
            node: self.local.id.clone(),
            key: key.to_string(),
            value: None,
            version,
        });
    }
}

/// Handle used to stop the engine's background tasks.
pub struct GossipHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl GossipHandle {
    /// Signals the background tasks to exit.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for all background tasks to terminate.
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Requests shutdown and waits for completion.
    pub async fn shutdown(self) {
        self.request_shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    #[derive(Default)]
    struct RecordingWatcher {
        events: Mutex<Vec<String>>,
    }

    impl RecordingWatcher {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl GossipWatcher for RecordingWatcher {
        fn on_join(&self, id: &str) {
            self.events.lock().push(format!("join:{id}"));
        }
        fn on_leave(&self, id: &str) {
            self.events.lock().push(format!("leave:{id}"));
        }
        fn on_down(&self, id: &str) {
            self.events.lock().push(format!("down:{id}"));
        }
        fn on_healthy(&self, id: &str) {
            self.events.lock().push(format!("healthy:{id}"));
        }
        fn on_expired(&self, id: &str) {
            self.events.lock().push(format!("expired:{id}"));
        }
        fn on_upsert_key(&self, id: &str, key: &str, value: &str) {
            self.events.lock().push(format!("upsert:{id}:{key}={value}"));
        }
        fn on_delete_key(&self, id: &str, key: &str) {
            self.events.lock().push(format!("delete:{id}:{key}"));
        }
    }

    fn peer(idx: u16) -> PeerInfo {
        PeerInfo {
            id: format!("node-{idx}"),
            gossip_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 45_000 + idx),
        }
    }

    fn alive_rumor(info: &PeerInfo, incarnation: u64) -> Rumor {
        Rumor {
            peer: info.clone(),
            state: PeerState::Alive,
            incarnation,
        }
    }

    async fn test_engine() -> (Arc<GossipEngine>, Arc<RecordingWatcher>) {
        let watcher = Arc::new(RecordingWatcher::default());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let advertise = socket.local_addr().unwrap();
        let engine = Arc::new(GossipEngine::new(
            PeerInfo {
                id: "local".to_string(),
                gossip_addr: advertise,
            },
            GossipConfig::default(),
            Arc::clone(&watcher) as Arc<dyn GossipWatcher>,
            socket,
        ));
        (engine, watcher)
    }

    #[tokio::test]
    async fn ping_from_unknown_peer_fires_join() {
        let (engine, watcher) = test_engine().await;
        let remote = peer(1);

        engine
            .handle_message(GossipMessage::Ping {
                from: remote.clone(),
                incarnation: 0,
                rumors: Vec::new(),
                digests: Vec::new(),
            })
            .await
            .unwrap();

        assert_eq!(watcher.events(), vec!["join:node-1"]);
        assert_eq!(engine.stats().alive, 1);
    }

    #[tokio::test]
    async fn state_updates_are_latest_wins_and_idempotent() {
        let (engine, watcher) = test_engine().await;
        let remote = peer(1);
        engine
            .handle_message(GossipMessage::Broadcast {
                rumors: vec![alive_rumor(&remote, 0)],
                deltas: Vec::new(),
            })
            .await
            .unwrap();

        let newer = Delta {
            node: remote.id.clone(),
            key: "endpoint:my-endpoint".to_string(),
            value: Some("5".to_string()),
            version: 2,
        };
        let stale = Delta {
            value: Some("1".to_string()),
            version: 1,
            ..newer.clone()
        };
        for delta in [newer.clone(), stale, newer] {
            engine
                .handle_message(GossipMessage::Broadcast {
                    rumors: Vec::new(),
                    deltas: vec![delta],
                })
                .await
                .unwrap();
        }

        assert_eq!(
            watcher.events(),
            vec!["join:node-1", "upsert:node-1:endpoint:my-endpoint=5"]
        );
    }

    #[tokio::test]
    async fn suspect_rumor_at_same_incarnation_marks_peer_down() {
        let (engine, watcher) = test_engine().await;
        let remote = peer(1);
        engine
            .handle_message(GossipMessage::Broadcast {
                rumors: vec![alive_rumor(&remote, 0)],
                deltas: Vec::new(),
            })
            .await
            .unwrap();

        engine
            .handle_message(GossipMessage::Broadcast {
                rumors: vec![Rumor {
                    peer: remote.clone(),
                    state: PeerState::Suspect,
                    incarnation: 0,
                }],
                deltas: Vec::new(),
            })
            .await
            .unwrap();
        // A newer incarnation refutes the suspicion.
        engine
            .handle_message(GossipMessage::Broadcast {
                rumors: vec![alive_rumor(&remote, 1)],
                deltas: Vec::new(),
            })
            .await
            .unwrap();

        assert_eq!(
            watcher.events(),
            vec!["join:node-1", "down:node-1", "healthy:node-1"]
        );
    }

    #[tokio::test]
    async fn left_peer_is_expired_after_the_timeout() {
        let (engine, watcher) = test_engine().await;
        let remote = peer(1);
        engine
            .handle_message(GossipMessage::Broadcast {
                rumors: vec![alive_rumor(&remote, 0)],
                deltas: Vec::new(),
            })
            .await
            .unwrap();
        engine
            .handle_message(GossipMessage::Broadcast {
                rumors: vec![Rumor {
                    peer: remote.clone(),
                    state: PeerState::Left,
                    incarnation: 1,
                }],
                deltas: Vec::new(),
            })
            .await
            .unwrap();

        let rumors = engine.reap(Instant::now() + engine.config.expiry_timeout * 2);
        assert!(rumors.is_empty());
        assert_eq!(
            watcher.events(),
            vec!["join:node-1", "leave:node-1", "expired:node-1"]
        );
        assert_eq!(engine.stats().total(), 0);
    }

    #[tokio::test]
    async fn rumors_about_the_local_node_are_refuted() {
        let (engine, watcher) = test_engine().await;
        engine
            .handle_message(GossipMessage::Broadcast {
                rumors: vec![Rumor {
                    peer: engine.local_peer().clone(),
                    state: PeerState::Dead,
                    incarnation: 5,
                }],
                deltas: Vec::new(),
            })
            .await
            .unwrap();

        assert!(watcher.events().is_empty());
        assert_eq!(engine.incarnation.load(Ordering::Acquire), 6);
    }

    #[tokio::test]
    async fn seed_placeholder_is_relabelled_on_first_contact() {
        let (engine, watcher) = test_engine().await;
        let remote = peer(1);
        engine.join(&[remote.gossip_addr]).await;
        // Placeholders are probe targets but invisible to the watcher.
        assert!(watcher.events().is_empty());
        assert_eq!(engine.stats().total(), 0);

        engine
            .handle_message(GossipMessage::Ping {
                from: remote.clone(),
                incarnation: 0,
                rumors: Vec::new(),
                digests: Vec::new(),
            })
            .await
            .unwrap();

        assert_eq!(watcher.events(), vec!["join:node-1"]);
        assert_eq!(engine.peers.len(), 1);
        assert!(engine.peers.contains_key("node-1"));
    }

    #[tokio::test]
    async fn updates_for_returns_state_the_digest_is_missing() {
        let (engine, _watcher) = test_engine().await;
        engine.upsert_local("proxy_addr", "10.26.104.56:8000");
        engine.upsert_local("admin_addr", "10.26.104.56:8001");

        let all = engine.updates_for(&[]);
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|delta| delta.node == "local"));

        let caught_up = engine.updates_for(&[Digest {
            node: "local".to_string(),
            version: 2,
        }]);
        assert!(caught_up.is_empty());
    }

    #[tokio::test]
    async fn deleted_local_keys_propagate_as_tombstones() {
        let (engine, _watcher) = test_engine().await;
        engine.upsert_local("endpoint:my-endpoint", "1");
        engine.delete_local("endpoint:my-endpoint");

        let updates = engine.updates_for(&[Digest {
            node: "local".to_string(),
            version: 1,
        }]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].value, None);
    }
}
