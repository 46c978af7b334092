//! Rule execution: listeners, connect handshakes, pumps, and relays
//!
//! The forwarder owns the runtime state of every started rule. Cloud-bound
//! rules get a listener here; agent-sourced rules get relay plumbing that
//! translates between the opener's session-local tunnel ids and the
//! cloud-allocated id space. Rate limiting and traffic accounting for all
//! rule kinds happen here, where every byte passes through.

use crate::error::ControlError;
use crate::limiter::RateLimiter;
use crate::pending::PendingAcks;
use crate::registry::{AgentRegistry, AgentSession};
use crate::stats::TrafficStats;
use crate::store::{Rule, RuleKind, Store};
use crate::tunnels::{spawn_socket_writer, TunnelEntry, TunnelTable};
use bytes::Bytes;
use dashmap::DashMap;
use portway_proto::{Frame, Message, Proto, RuleSpec};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Read buffer for TCP pumps.
pub const PUMP_BUF: usize = 32 * 1024;

/// Maximum UDP datagram we accept.
const UDP_BUF: usize = 64 * 1024;

/// How long the opener waits for the peer's `ConnectAck`.
pub const CONNECT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Dial timeout for targets the cloud reaches itself.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle lifetime of a UDP flow-index entry or reply socket.
pub const UDP_FLOW_IDLE: Duration = Duration::from_secs(60);

/// Capacity of a relay half's frame queue.
const RELAY_QUEUE: usize = 64;

/// Enqueue deadline towards a relay half before the tunnel is torn down.
const RELAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime state of a started rule.
pub struct RuleState {
    pub rule: Rule,
    active: AtomicBool,
    pub limiter: RateLimiter,
    traffic_used: AtomicU64,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Bound datagram socket for cloud-bound UDP rules; used to route
    /// replies back out the listening port.
    udp_socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl RuleState {
    fn new(rule: Rule) -> Arc<Self> {
        Arc::new(Self {
            limiter: RateLimiter::new(rule.rate_limit),
            traffic_used: AtomicU64::new(rule.traffic_used),
            active: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
            udp_socket: Mutex::new(None),
            rule,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn traffic_used(&self) -> u64 {
        self.traffic_used.load(Ordering::Relaxed)
    }

    /// Whether the rule's byte budget is already spent.
    pub fn over_limit(&self) -> bool {
        self.rule.traffic_limit > 0 && self.traffic_used() >= self.rule.traffic_limit
    }

    fn track_task(&self, handle: tokio::task::JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    /// Flip inactive and abort the listener tasks. The returned handles
    /// let the caller await until the listener sockets are actually
    /// dropped, so the port can be rebound immediately.
    fn deactivate(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.active.store(false, Ordering::Relaxed);
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        self.udp_socket.lock().unwrap().take();
        tasks
    }
}

/// Where a relayed tunnel's bytes go.
#[derive(Debug, Clone)]
enum RelayDest {
    /// A cloud-held socket in the tunnel table (agent→cloud rules).
    Local { tunnel_id: u32 },
    /// Another agent's channel (agent→agent rules).
    Session { agent_id: String, tunnel_id: u32 },
}

/// One direction of a relayed tunnel, keyed by the id it carries on the
/// originating session's wire.
struct RelayHalf {
    tx: mpsc::Sender<Bytes>,
    shutdown: watch::Sender<bool>,
    dest: RelayDest,
    rule_id: String,
}

impl RelayHalf {
    fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Reply routing for forwarded datagrams, keyed by
/// `(replying agent, client addr, target addr)`.
enum UdpFlowDest {
    /// Reply goes back out a cloud-bound listener to the original client.
    Listener {
        socket: Arc<UdpSocket>,
        client: SocketAddr,
    },
    /// Reply goes back to the source agent's channel (agent→agent rules).
    Session { agent_id: String },
}

struct UdpFlow {
    dest: UdpFlowDest,
    last_seen: Instant,
}

/// Everything a relay drain task needs, produced by `insert_relay_half`
/// and consumed by `spawn_relay_task`.
struct RelayTask {
    origin: (String, u32),
    dest: RelayDest,
    rule_id: String,
    account: bool,
    rx: mpsc::Receiver<Bytes>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Traffic direction for the global counters.
#[derive(Clone, Copy)]
enum Direction {
    Tx,
    Rx,
}

/// Executes rules: listeners, handshakes, pumps, relays, accounting.
#[derive(Clone)]
pub struct Forwarder {
    store: Arc<dyn Store>,
    pub(crate) registry: AgentRegistry,
    pub(crate) tunnels: Arc<TunnelTable>,
    pub(crate) pending: PendingAcks,
    pub(crate) stats: Arc<TrafficStats>,
    rules: Arc<RwLock<HashMap<String, Arc<RuleState>>>>,
    relays: Arc<DashMap<(String, u32), RelayHalf>>,
    udp_flows: Arc<DashMap<(String, String, String), UdpFlow>>,
    /// Cloud-held reply sockets for agent→cloud UDP rules, keyed by
    /// `(source agent, client addr, target addr)`.
    udp_relay_socks: Arc<DashMap<(String, String, String), Arc<UdpSocket>>>,
}

impl Forwarder {
    pub fn new(
        store: Arc<dyn Store>,
        registry: AgentRegistry,
        tunnels: Arc<TunnelTable>,
        pending: PendingAcks,
        stats: Arc<TrafficStats>,
    ) -> Self {
        Self {
            store,
            registry,
            tunnels,
            pending,
            stats,
            rules: Arc::new(RwLock::new(HashMap::new())),
            relays: Arc::new(DashMap::new()),
            udp_flows: Arc::new(DashMap::new()),
            udp_relay_socks: Arc::new(DashMap::new()),
        }
    }

    /// Load rules from the store and start every enabled one. A rule that
    /// fails to bind is logged and skipped; it stays registered in the
    /// store but inactive.
    pub async fn restore(&self) -> Result<(), ControlError> {
        for rule in self.store.list_rules().await? {
            if !rule.enabled {
                continue;
            }
            let id = rule.id.clone();
            if let Err(e) = self.start_rule(rule).await {
                warn!(rule = %id, error = %e, "failed to start rule on restore");
            }
        }
        Ok(())
    }

    pub fn rule_state(&self, rule_id: &str) -> Option<Arc<RuleState>> {
        self.rules.read().unwrap().get(rule_id).cloned()
    }

    pub fn rule_states(&self) -> Vec<Arc<RuleState>> {
        self.rules.read().unwrap().values().cloned().collect()
    }

    pub fn rule_traffic(&self, rule_id: &str) -> Option<u64> {
        self.rule_state(rule_id).map(|s| s.traffic_used())
    }

    /// Start executing a rule. Cloud-bound kinds bind their listener here;
    /// agent-sourced kinds only get runtime state (the caller pushes the
    /// assignment to the source agent).
    pub async fn start_rule(&self, rule: Rule) -> Result<(), ControlError> {
        if self.rules.read().unwrap().contains_key(&rule.id) {
            return Err(ControlError::RuleAlreadyRunning(rule.id));
        }

        let state = RuleState::new(rule);
        let rule = &state.rule;

        match (rule.kind, rule.proto) {
            (RuleKind::CloudToAgent, Proto::Tcp) | (RuleKind::CloudDirect, Proto::Tcp) => {
                let listener = TcpListener::bind(("0.0.0.0", rule.listen_port))
                    .await
                    .map_err(|source| ControlError::Bind {
                        port: rule.listen_port,
                        source,
                    })?;
                let direct = rule.kind == RuleKind::CloudDirect;
                let fwd = self.clone();
                let st = state.clone();
                state.track_task(tokio::spawn(async move {
                    fwd.run_tcp_listener(st, listener, direct).await;
                }));
            }
            (RuleKind::CloudToAgent, Proto::Udp) | (RuleKind::CloudDirect, Proto::Udp) => {
                let socket = UdpSocket::bind(("0.0.0.0", rule.listen_port))
                    .await
                    .map_err(|source| ControlError::Bind {
                        port: rule.listen_port,
                        source,
                    })?;
                let socket = Arc::new(socket);
                *state.udp_socket.lock().unwrap() = Some(socket.clone());
                let fwd = self.clone();
                let st = state.clone();
                let direct = rule.kind == RuleKind::CloudDirect;
                state.track_task(tokio::spawn(async move {
                    if direct {
                        fwd.run_udp_direct(st, socket).await;
                    } else {
                        fwd.run_udp_remote(st, socket).await;
                    }
                }));
            }
            (RuleKind::AgentToCloud, _) | (RuleKind::AgentToAgent, _) => {
                // The source agent binds; cloud only relays.
            }
        }

        info!(
            rule = %rule.id,
            name = %rule.name,
            kind = ?rule.kind,
            proto = %rule.proto,
            listen_port = rule.listen_port,
            target = %rule.target_addr(),
            "started forward rule"
        );

        let id = state.rule.id.clone();
        self.rules.write().unwrap().insert(id, state);
        Ok(())
    }

    /// Stop a rule: close its listener, tear down its tunnels, flush its
    /// traffic counter.
    pub async fn stop_rule(&self, rule_id: &str) -> Result<(), ControlError> {
        let Some(state) = self.rules.write().unwrap().remove(rule_id) else {
            return Ok(());
        };
        let udp_socket = state.udp_socket.lock().unwrap().clone();
        for task in state.deactivate() {
            let _ = task.await;
        }

        // Flows routed through the rule's listener die with it; session
        // flows age out through the sweep.
        if let Some(socket) = udp_socket {
            self.udp_flows.retain(|_, flow| match &flow.dest {
                UdpFlowDest::Listener { socket: s, .. } => !Arc::ptr_eq(s, &socket),
                UdpFlowDest::Session { .. } => true,
            });
        }

        for tunnel_id in self.tunnels.ids_for_rule(rule_id) {
            self.release_tunnel(tunnel_id, true).await;
        }

        // Relayed tunnels of this rule have no table entry of their own on
        // the agent→agent path; sweep them by origin key.
        let origins: Vec<(String, u32)> = self
            .relays
            .iter()
            .filter(|e| e.value().rule_id == rule_id)
            .map(|e| e.key().clone())
            .collect();
        for (agent_id, wire_id) in origins {
            self.finish_relay(&agent_id, wire_id, true, false).await;
        }

        if let Err(e) = self
            .store
            .update_traffic_used(rule_id, state.traffic_used())
            .await
        {
            warn!(rule = %rule_id, error = %e, "failed to flush traffic on stop");
        }

        info!(rule = %rule_id, name = %state.rule.name, "stopped forward rule");
        Ok(())
    }

    /// Assignment frames for every active agent-sourced rule of an agent.
    /// Pushed when the agent connects and when a rule is enabled.
    pub fn assignments_for(&self, agent_id: &str) -> Vec<Frame> {
        self.rules
            .read()
            .unwrap()
            .values()
            .filter(|s| {
                s.is_active()
                    && s.rule.kind.is_agent_sourced()
                    && s.rule.source_agent_id.as_deref() == Some(agent_id)
            })
            .map(|s| {
                Frame::new(
                    0,
                    Message::RuleAssign(RuleSpec {
                        rule_id: s.rule.id.clone(),
                        name: s.rule.name.clone(),
                        proto: s.rule.proto,
                        listen_port: s.rule.listen_port,
                        target_host: s.rule.target_host.clone(),
                        target_port: s.rule.target_port,
                    }),
                )
            })
            .collect()
    }

    /// Persist traffic counters and sweep idle UDP flows. Run from the
    /// server's maintenance loop, bounded to once per ten seconds.
    pub async fn flush(&self) {
        for state in self.rule_states() {
            if let Err(e) = self
                .store
                .update_traffic_used(&state.rule.id, state.traffic_used())
                .await
            {
                warn!(rule = %state.rule.id, error = %e, "traffic flush failed");
            }
        }
        self.udp_flows
            .retain(|_, flow| flow.last_seen.elapsed() < UDP_FLOW_IDLE);
    }

    /// Account `n` forwarded bytes against a rule and the global counters.
    /// Returns false once the rule's byte budget is exhausted; the caller
    /// tears down its tunnel.
    fn add_traffic(&self, state: &RuleState, n: u64, dir: Direction) -> bool {
        match dir {
            Direction::Tx => self.stats.add_tx(n),
            Direction::Rx => self.stats.add_rx(n),
        }
        self.add_rule_traffic(state, n)
    }

    /// Rule-counter half of the accounting, for paths whose bytes already
    /// hit the global counters at the dispatcher.
    fn add_rule_traffic(&self, state: &RuleState, n: u64) -> bool {
        let total = state.traffic_used.fetch_add(n, Ordering::Relaxed) + n;
        !(state.rule.traffic_limit > 0 && total > state.rule.traffic_limit)
    }

    // ------------------------------------------------------------------
    // Cloud-bound TCP
    // ------------------------------------------------------------------

    async fn run_tcp_listener(&self, state: Arc<RuleState>, listener: TcpListener, direct: bool) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let fwd = self.clone();
                    let st = state.clone();
                    tokio::spawn(async move {
                        if direct {
                            fwd.handle_direct_conn(st, socket, peer).await;
                        } else {
                            fwd.handle_remote_conn(st, socket, peer).await;
                        }
                    });
                }
                Err(e) => {
                    if !state.is_active() {
                        return;
                    }
                    warn!(rule = %state.rule.id, error = %e, "accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// One accepted public connection for a cloud→agent rule: handshake
    /// with the target agent, then pump client bytes into the channel.
    async fn handle_remote_conn(&self, state: Arc<RuleState>, stream: TcpStream, peer: SocketAddr) {
        if !state.is_active() || state.over_limit() {
            debug!(rule = %state.rule.id, client = %peer, "refusing connection");
            return;
        }

        let rule = &state.rule;
        let Some(agent_id) = rule.target_agent_id.as_deref() else {
            warn!(rule = %rule.id, "cloud→agent rule without target agent");
            return;
        };
        let Some(session) = self.registry.get(agent_id) else {
            debug!(rule = %rule.id, agent_id, "target agent not connected");
            return;
        };

        let tunnel_id = self.tunnels.allocate_id();

        // Register the endpoint before the handshake: if the target speaks
        // first, its bytes can arrive right behind the ack and must find
        // the tunnel already in the table.
        let (read_half, write_half) = stream.into_split();
        let (entry, writer_rx, writer_shutdown) = TunnelEntry::new(
            tunnel_id,
            session.agent_id.clone(),
            rule.id.clone(),
            rule.proto,
            rule.target_addr(),
            None,
        );
        spawn_socket_writer(tunnel_id, write_half, writer_rx, writer_shutdown);
        let pump_shutdown = entry.shutdown_signal();
        self.tunnels.insert(entry);
        session.track_tunnel(tunnel_id);

        let ack = self.pending.register(tunnel_id);
        let connect = Frame::connect(tunnel_id, rule.proto, rule.target_host.clone(), rule.target_port);
        if session.send(connect).await.is_err() {
            self.release_tunnel(tunnel_id, false).await;
            return;
        }

        let reply = match tokio::time::timeout(CONNECT_ACK_TIMEOUT, ack).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                debug!(tunnel_id, "agent session dropped during handshake");
                self.release_tunnel(tunnel_id, false).await;
                return;
            }
            Err(_) => {
                debug!(tunnel_id, rule = %rule.id, "connect ack timed out");
                // A late ack may still have opened the target socket; the
                // close tells the agent to drop it.
                self.release_tunnel(tunnel_id, true).await;
                return;
            }
        };
        if !reply.success {
            debug!(tunnel_id, error = %reply.error, "tunnel connect refused");
            self.release_tunnel(tunnel_id, false).await;
            return;
        }

        info!(
            tunnel_id,
            rule = %rule.id,
            client = %peer,
            agent_id = %session.agent_id,
            target = %rule.target_addr(),
            "tunnel established"
        );

        self.pump_to_session(&state, &session, tunnel_id, read_half, pump_shutdown)
            .await;
    }

    /// Client→channel pump. Runs until EOF, error, teardown, or the rule's
    /// byte budget runs out, then releases the tunnel exactly once.
    async fn pump_to_session<R>(
        &self,
        state: &RuleState,
        session: &Arc<AgentSession>,
        tunnel_id: u32,
        mut source: R,
        mut shutdown: watch::Receiver<bool>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; PUMP_BUF];
        let notify_peer = loop {
            tokio::select! {
                _ = shutdown.changed() => break false,
                res = source.read(&mut buf) => match res {
                    Ok(0) | Err(_) => break true,
                    Ok(n) => {
                        if !self.add_traffic(state, n as u64, Direction::Tx) {
                            warn!(rule = %state.rule.id, tunnel_id, "traffic limit exceeded");
                            break true;
                        }
                        state.limiter.wait(n).await;
                        let frame = Frame::data(tunnel_id, Bytes::copy_from_slice(&buf[..n]));
                        match session.send_data(frame).await {
                            Ok(()) => {}
                            Err(ControlError::ChannelStalled(_)) => {
                                warn!(tunnel_id, agent_id = %session.agent_id, "outbound queue stalled, dropping tunnel");
                                break true;
                            }
                            Err(_) => break false,
                        }
                    }
                }
            }
        };
        self.release_tunnel(tunnel_id, notify_peer).await;
    }

    /// Remove a tunnel from the table and undo everything registered for
    /// it. Safe to call from multiple teardown paths; only the first call
    /// does work.
    pub async fn release_tunnel(&self, tunnel_id: u32, notify_peer: bool) {
        let Some(entry) = self.tunnels.remove(tunnel_id) else {
            return;
        };
        entry.shutdown();
        self.pending.cancel(tunnel_id);
        if let Some(local_id) = entry.peer_local_id {
            if let Some((_, half)) = self.relays.remove(&(entry.agent_id.clone(), local_id)) {
                half.cancel();
            }
        }
        if let Some(session) = self.registry.get(&entry.agent_id) {
            session.untrack_tunnel(entry.wire_id());
            if notify_peer {
                let _ = session.send_data(Frame::close(entry.wire_id())).await;
            }
        }
        debug!(tunnel_id, rule = %entry.rule_id, "tunnel released");
    }

    // ------------------------------------------------------------------
    // Cloud-direct
    // ------------------------------------------------------------------

    /// Proxy an accepted connection straight to the target, bypassing any
    /// agent. Both directions share the rule's limiter and counter.
    async fn handle_direct_conn(&self, state: Arc<RuleState>, client: TcpStream, peer: SocketAddr) {
        if !state.is_active() || state.over_limit() {
            debug!(rule = %state.rule.id, client = %peer, "refusing connection");
            return;
        }

        let target_addr = state.rule.target_addr();
        let target =
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target_addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(rule = %state.rule.id, target = %target_addr, error = %e, "target dial failed");
                    return;
                }
                Err(_) => {
                    warn!(rule = %state.rule.id, target = %target_addr, "target dial timed out");
                    return;
                }
            };

        debug!(rule = %state.rule.id, client = %peer, target = %target_addr, "direct proxy established");

        let (client_r, client_w) = client.into_split();
        let (target_r, target_w) = target.into_split();

        let forward = self.copy_with_limits(&state, client_r, target_w, Direction::Tx);
        let backward = self.copy_with_limits(&state, target_r, client_w, Direction::Rx);

        // Either side finishing drops both halves and closes the sockets.
        tokio::select! {
            _ = forward => {}
            _ = backward => {}
        }
    }

    async fn copy_with_limits<R, W>(&self, state: &RuleState, mut src: R, mut dst: W, dir: Direction)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; PUMP_BUF];
        loop {
            let n = match src.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if !self.add_traffic(state, n as u64, dir) {
                warn!(rule = %state.rule.id, "traffic limit exceeded");
                break;
            }
            state.limiter.wait(n).await;
            if dst.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = dst.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Cloud-bound UDP
    // ------------------------------------------------------------------

    /// Datagram loop for a cloud→agent UDP rule: wrap each datagram with
    /// its addressing and forward it over the target agent's channel,
    /// recording the flow so the reply finds its way back.
    async fn run_udp_remote(&self, state: Arc<RuleState>, socket: Arc<UdpSocket>) {
        let rule = &state.rule;
        let Some(agent_id) = rule.target_agent_id.clone() else {
            warn!(rule = %rule.id, "cloud→agent udp rule without target agent");
            return;
        };
        let target_addr = rule.target_addr();
        let mut buf = vec![0u8; UDP_BUF];

        loop {
            let (n, client) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    if !state.is_active() {
                        return;
                    }
                    debug!(rule = %rule.id, error = %e, "udp recv error");
                    continue;
                }
            };

            if state.over_limit() {
                continue;
            }
            let Some(session) = self.registry.get(&agent_id) else {
                continue;
            };
            if !self.add_traffic(&state, n as u64, Direction::Tx) {
                continue;
            }
            state.limiter.wait(n).await;

            self.udp_flows.insert(
                (agent_id.clone(), client.to_string(), target_addr.clone()),
                UdpFlow {
                    dest: UdpFlowDest::Listener {
                        socket: socket.clone(),
                        client,
                    },
                    last_seen: Instant::now(),
                },
            );

            let frame = Frame::udp_data(
                (client.ip().to_string(), client.port()),
                (rule.target_host.clone(), rule.target_port),
                Bytes::copy_from_slice(&buf[..n]),
            );
            let _ = session.send_data(frame).await;
        }
    }

    /// Datagram loop for a cloud-direct UDP rule: one ephemeral socket per
    /// client, replies copied back from a per-client reader.
    async fn run_udp_direct(&self, state: Arc<RuleState>, socket: Arc<UdpSocket>) {
        let target_addr = state.rule.target_addr();
        let clients: Arc<DashMap<SocketAddr, Arc<UdpSocket>>> = Arc::new(DashMap::new());
        let mut buf = vec![0u8; UDP_BUF];

        loop {
            let (n, client) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    if !state.is_active() {
                        return;
                    }
                    debug!(rule = %state.rule.id, error = %e, "udp recv error");
                    continue;
                }
            };

            if state.over_limit() {
                continue;
            }
            if !self.add_traffic(&state, n as u64, Direction::Tx) {
                continue;
            }
            state.limiter.wait(n).await;

            let target_sock = match clients.get(&client) {
                Some(sock) => sock.clone(),
                None => {
                    let sock = match UdpSocket::bind("0.0.0.0:0").await {
                        Ok(s) => Arc::new(s),
                        Err(e) => {
                            warn!(rule = %state.rule.id, error = %e, "udp socket bind failed");
                            continue;
                        }
                    };
                    if let Err(e) = sock.connect(&target_addr).await {
                        warn!(rule = %state.rule.id, target = %target_addr, error = %e, "udp connect failed");
                        continue;
                    }
                    clients.insert(client, sock.clone());

                    let fwd = self.clone();
                    let listen = socket.clone();
                    let reply_sock = sock.clone();
                    let clients = clients.clone();
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; UDP_BUF];
                        loop {
                            match tokio::time::timeout(UDP_FLOW_IDLE, reply_sock.recv(&mut buf))
                                .await
                            {
                                Ok(Ok(n)) => {
                                    fwd.stats.add_rx(n as u64);
                                    let _ = listen.send_to(&buf[..n], client).await;
                                }
                                Ok(Err(_)) | Err(_) => break,
                            }
                        }
                        clients.remove(&client);
                    });
                    sock
                }
            };

            let _ = target_sock.send(&buf[..n]).await;
        }
    }

    /// Inbound `UdpData` from an agent: either a reply for a recorded flow
    /// or a fresh datagram for an agent-sourced UDP rule.
    pub async fn handle_udp_from_agent(
        &self,
        session: &Arc<AgentSession>,
        src: (String, u16),
        dst: (String, u16),
        data: Bytes,
    ) {
        let src_addr = format!("{}:{}", src.0, src.1);
        let dst_addr = format!("{}:{}", dst.0, dst.1);

        // Reply path: dst is the original client, src the target we sent to.
        let flow_key = (session.agent_id.clone(), dst_addr.clone(), src_addr.clone());
        let reply_dest = self.udp_flows.get_mut(&flow_key).map(|mut flow| {
            flow.last_seen = Instant::now();
            match &flow.dest {
                UdpFlowDest::Listener { socket, client } => {
                    UdpFlowDest::Listener {
                        socket: socket.clone(),
                        client: *client,
                    }
                }
                UdpFlowDest::Session { agent_id } => UdpFlowDest::Session {
                    agent_id: agent_id.clone(),
                },
            }
        });
        if let Some(dest) = reply_dest {
            self.stats.add_rx(data.len() as u64);
            match dest {
                UdpFlowDest::Listener { socket, client } => {
                    let _ = socket.send_to(&data, client).await;
                }
                UdpFlowDest::Session { agent_id } => {
                    if let Some(source) = self.registry.get(&agent_id) {
                        let _ = source
                            .send_data(Frame::udp_data(src, dst, data))
                            .await;
                    }
                }
            }
            return;
        }

        // Fresh datagram from an agent-sourced UDP rule of this session.
        let state = self.rules.read().unwrap().values().cloned().find(|s| {
            s.is_active()
                && s.rule.kind.is_agent_sourced()
                && s.rule.proto == Proto::Udp
                && s.rule.source_agent_id.as_deref() == Some(session.agent_id.as_str())
                && s.rule.target_host == dst.0
                && s.rule.target_port == dst.1
        });
        let Some(state) = state else {
            debug!(agent_id = %session.agent_id, dst = %dst_addr, "udp datagram matches no flow or rule");
            return;
        };

        if state.over_limit() || !self.add_traffic(&state, data.len() as u64, Direction::Rx) {
            return;
        }
        state.limiter.wait(data.len()).await;

        match state.rule.kind {
            RuleKind::AgentToAgent => {
                let Some(target_agent) = state.rule.target_agent_id.clone() else {
                    return;
                };
                let Some(target_session) = self.registry.get(&target_agent) else {
                    return;
                };
                // Reply from the target agent retraces to this session.
                self.udp_flows.insert(
                    (target_agent, src_addr, dst_addr),
                    UdpFlow {
                        dest: UdpFlowDest::Session {
                            agent_id: session.agent_id.clone(),
                        },
                        last_seen: Instant::now(),
                    },
                );
                let _ = target_session
                    .send_data(Frame::udp_data(src, dst, data))
                    .await;
            }
            RuleKind::AgentToCloud => {
                self.relay_udp_to_target(session, &state, src, dst, data)
                    .await;
            }
            _ => {}
        }
    }

    /// Agent→cloud UDP: cloud opens (or reuses) an ephemeral socket per
    /// client flow, sends to the target itself, and pipes replies back to
    /// the source agent.
    async fn relay_udp_to_target(
        &self,
        session: &Arc<AgentSession>,
        state: &Arc<RuleState>,
        src: (String, u16),
        dst: (String, u16),
        data: Bytes,
    ) {
        let target_addr = state.rule.target_addr();
        let flow_key = (
            session.agent_id.clone(),
            format!("{}:{}", src.0, src.1),
            target_addr.clone(),
        );

        let existing = self.udp_relay_socks.get(&flow_key).map(|s| s.clone());
        let sock = match existing {
            Some(sock) => sock,
            None => {
                let sock = match UdpSocket::bind("0.0.0.0:0").await {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        warn!(rule = %state.rule.id, error = %e, "udp relay bind failed");
                        return;
                    }
                };
                if sock.connect(&target_addr).await.is_err() {
                    return;
                }
                self.udp_relay_socks.insert(flow_key.clone(), sock.clone());

                let session = session.clone();
                let reply_sock = sock.clone();
                let socks = self.udp_relay_socks.clone();
                let stats = self.stats.clone();
                let client = src.clone();
                let target = dst.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; UDP_BUF];
                    loop {
                        match tokio::time::timeout(UDP_FLOW_IDLE, reply_sock.recv(&mut buf)).await {
                            Ok(Ok(n)) => {
                                stats.add_tx(n as u64);
                                let frame = Frame::udp_data(
                                    target.clone(),
                                    client.clone(),
                                    Bytes::copy_from_slice(&buf[..n]),
                                );
                                if session.send_data(frame).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Err(_)) | Err(_) => break,
                        }
                    }
                    socks.remove(&flow_key);
                });
                sock
            }
        };

        let _ = sock.send(&data).await;
    }

    // ------------------------------------------------------------------
    // Agent-sourced TCP relays
    // ------------------------------------------------------------------

    /// `TunnelOpen` from a source agent: resolve the rule and either dial
    /// the target from cloud (agent→cloud) or handshake with the target
    /// agent and install a relay pair (agent→agent). `local_id` is the id
    /// this tunnel carries on the opener's channel.
    pub async fn handle_tunnel_open(
        &self,
        session: Arc<AgentSession>,
        local_id: u32,
        rule_id: String,
    ) {
        let refuse = |reason: &str| Frame::connect_err(local_id, reason);

        let Some(state) = self.rule_state(&rule_id) else {
            let _ = session.send(refuse("unknown rule")).await;
            return;
        };
        let rule = &state.rule;
        if !rule.kind.is_agent_sourced()
            || rule.source_agent_id.as_deref() != Some(session.agent_id.as_str())
        {
            let _ = session.send(refuse("rule not assigned to this agent")).await;
            return;
        }
        if !state.is_active() {
            let _ = session.send(refuse("rule inactive")).await;
            return;
        }
        if state.over_limit() {
            let _ = session.send(refuse("traffic limit exceeded")).await;
            return;
        }

        match rule.kind {
            RuleKind::AgentToCloud => {
                self.open_local_relay(session, &state, local_id).await;
            }
            RuleKind::AgentToAgent => {
                self.open_session_relay(session, &state, local_id).await;
            }
            _ => unreachable!("checked is_agent_sourced"),
        }
    }

    /// Agent→cloud: dial the target from here, park the socket in the
    /// tunnel table, and pump replies straight back to the opener.
    async fn open_local_relay(
        &self,
        session: Arc<AgentSession>,
        state: &Arc<RuleState>,
        local_id: u32,
    ) {
        let rule = &state.rule;
        let target_addr = rule.target_addr();

        let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target_addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = session
                    .send(Frame::connect_err(local_id, e.to_string()))
                    .await;
                return;
            }
            Err(_) => {
                let _ = session
                    .send(Frame::connect_err(local_id, "dial timed out"))
                    .await;
                return;
            }
        };

        let cloud_id = self.tunnels.allocate_id();
        let (read_half, write_half) = stream.into_split();
        let (entry, writer_rx, writer_shutdown) = TunnelEntry::new(
            cloud_id,
            session.agent_id.clone(),
            rule.id.clone(),
            rule.proto,
            target_addr.clone(),
            Some(local_id),
        );
        spawn_socket_writer(cloud_id, write_half, writer_rx, writer_shutdown);
        let pump_shutdown = entry.shutdown_signal();
        self.tunnels.insert(entry);
        session.track_tunnel(local_id);

        let half = self.insert_relay_half(
            (session.agent_id.clone(), local_id),
            RelayDest::Local { tunnel_id: cloud_id },
            rule.id.clone(),
            true,
        );
        self.spawn_relay_task(half);

        if session.send(Frame::connect_ok(local_id)).await.is_err() {
            self.release_tunnel(cloud_id, false).await;
            return;
        }

        info!(
            tunnel_id = cloud_id,
            local_id,
            rule = %rule.id,
            agent_id = %session.agent_id,
            target = %target_addr,
            "agent→cloud tunnel established"
        );

        // Target→opener pump. Replies are not rate limited, matching the
        // cloud-bound path.
        let fwd = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_BUF];
            let mut source = read_half;
            let mut shutdown = pump_shutdown;
            let notify = loop {
                tokio::select! {
                    _ = shutdown.changed() => break false,
                    res = source.read(&mut buf) => match res {
                        Ok(0) | Err(_) => break true,
                        Ok(n) => {
                            fwd.stats.add_tx(n as u64);
                            let frame = Frame::data(local_id, Bytes::copy_from_slice(&buf[..n]));
                            if session.send_data(frame).await.is_err() {
                                break false;
                            }
                        }
                    }
                }
            };
            fwd.release_tunnel(cloud_id, notify).await;
        });
    }

    /// Agent→agent: handshake with the target agent under a cloud id and
    /// install the id-translating relay pair.
    async fn open_session_relay(
        &self,
        session: Arc<AgentSession>,
        state: &Arc<RuleState>,
        local_id: u32,
    ) {
        let rule = &state.rule;
        let Some(target_agent) = rule.target_agent_id.clone() else {
            let _ = session
                .send(Frame::connect_err(local_id, "rule has no target agent"))
                .await;
            return;
        };
        let Some(target_session) = self.registry.get(&target_agent) else {
            let _ = session
                .send(Frame::connect_err(local_id, "target agent not connected"))
                .await;
            return;
        };

        let cloud_id = self.tunnels.allocate_id();

        // The reverse half's queue goes in before the handshake so a
        // target that speaks first cannot race its own ack; its task only
        // starts after the opener has been acked, keeping the ack ahead
        // of any buffered data on the opener's channel.
        let reverse = self.insert_relay_half(
            (target_agent.clone(), cloud_id),
            RelayDest::Session {
                agent_id: session.agent_id.clone(),
                tunnel_id: local_id,
            },
            rule.id.clone(),
            false,
        );
        target_session.track_tunnel(cloud_id);

        let ack = self.pending.register(cloud_id);
        let connect = Frame::connect(cloud_id, rule.proto, rule.target_host.clone(), rule.target_port);
        if target_session.send(connect).await.is_err() {
            self.pending.cancel(cloud_id);
            self.finish_relay(&target_agent, cloud_id, false, false).await;
            let _ = session
                .send(Frame::connect_err(local_id, "target agent unreachable"))
                .await;
            return;
        }

        let reply = match tokio::time::timeout(CONNECT_ACK_TIMEOUT, ack).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) | Err(_) => {
                self.pending.cancel(cloud_id);
                self.finish_relay(&target_agent, cloud_id, true, false).await;
                let _ = session
                    .send(Frame::connect_err(local_id, "connect ack timed out"))
                    .await;
                return;
            }
        };
        if !reply.success {
            self.finish_relay(&target_agent, cloud_id, false, false).await;
            let _ = session
                .send(Frame::connect_err(local_id, reply.error))
                .await;
            return;
        }

        // Source→target is the accounted direction; the reverse half only
        // translates ids.
        let forward = self.insert_relay_half(
            (session.agent_id.clone(), local_id),
            RelayDest::Session {
                agent_id: target_agent.clone(),
                tunnel_id: cloud_id,
            },
            rule.id.clone(),
            true,
        );
        session.track_tunnel(local_id);
        self.spawn_relay_task(forward);

        // Ack first, then release anything the target already sent: both
        // ride the opener's FIFO queue, so the ack cannot be overtaken.
        if session.send(Frame::connect_ok(local_id)).await.is_err() {
            self.finish_relay(&session.agent_id, local_id, false, false)
                .await;
            return;
        }
        self.spawn_relay_task(reverse);

        info!(
            tunnel_id = cloud_id,
            local_id,
            rule = %rule.id,
            source = %session.agent_id,
            target = %target_agent,
            "agent→agent relay established"
        );
    }

    /// Insert one relay direction's queue into the routing map without
    /// starting its drain task. Early frames buffer in the queue until
    /// [`Self::spawn_relay_task`] releases them, which lets the caller
    /// sequence the opener's ack ahead of any buffered data.
    fn insert_relay_half(
        &self,
        origin: (String, u32),
        dest: RelayDest,
        rule_id: String,
        account: bool,
    ) -> RelayTask {
        let (tx, rx) = mpsc::channel::<Bytes>(RELAY_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.relays.insert(
            origin.clone(),
            RelayHalf {
                tx,
                shutdown: shutdown_tx,
                dest: dest.clone(),
                rule_id: rule_id.clone(),
            },
        );
        RelayTask {
            origin,
            dest,
            rule_id,
            account,
            rx,
            shutdown_rx,
        }
    }

    /// Drain one relay direction: accounting and rate limiting on the
    /// source direction, then forward to the destination. Runs on its own
    /// task so the session reader never waits on sockets or limiters.
    fn spawn_relay_task(&self, task: RelayTask) {
        let RelayTask {
            origin,
            dest,
            rule_id,
            account,
            mut rx,
            mut shutdown_rx,
        } = task;
        let fwd = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    data = rx.recv() => match data {
                        // Empty payload is the orderly-close marker queued
                        // behind any remaining data.
                        Some(data) if data.is_empty() => {
                            fwd.finish_relay(&origin.0, origin.1, false, true).await;
                            return;
                        }
                        Some(data) => {
                            if account {
                                if let Some(state) = fwd.rule_state(&rule_id) {
                                    if !fwd.add_rule_traffic(&state, data.len() as u64) {
                                        warn!(rule = %rule_id, "traffic limit exceeded");
                                        fwd.finish_relay(&origin.0, origin.1, true, false).await;
                                        return;
                                    }
                                    state.limiter.wait(data.len()).await;
                                }
                            }
                            let ok = match &dest {
                                RelayDest::Local { tunnel_id } => match fwd.tunnels.get(*tunnel_id) {
                                    Some(entry) => entry.write(data).await.is_ok(),
                                    None => false,
                                },
                                RelayDest::Session { agent_id, tunnel_id } => {
                                    match fwd.registry.get(agent_id) {
                                        Some(peer) => peer
                                            .send_data(Frame::data(*tunnel_id, data))
                                            .await
                                            .is_ok(),
                                        None => false,
                                    }
                                }
                            };
                            if !ok {
                                fwd.finish_relay(&origin.0, origin.1, true, false).await;
                                return;
                            }
                        }
                        None => return,
                    },
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
    }

    /// Route a relayed `Data` frame. Returns false when no relay exists for
    /// this (session, id) pair, in which case the caller tries the tunnel
    /// table.
    pub async fn relay_data(&self, session: &Arc<AgentSession>, wire_id: u32, data: Bytes) -> bool {
        let key = (session.agent_id.clone(), wire_id);
        let tx = match self.relays.get(&key) {
            Some(half) => half.tx.clone(),
            None => return false,
        };
        if tx.send_timeout(data, RELAY_TIMEOUT).await.is_err() {
            warn!(agent_id = %session.agent_id, wire_id, "relay queue stalled, dropping tunnel");
            self.finish_relay(&session.agent_id, wire_id, true, false)
                .await;
        }
        true
    }

    /// Route a relayed `Close` frame: queue the orderly-close marker so it
    /// cannot overtake data already accepted. Returns false when no relay
    /// exists.
    pub async fn relay_close(&self, session: &Arc<AgentSession>, wire_id: u32) -> bool {
        let key = (session.agent_id.clone(), wire_id);
        let tx = match self.relays.get(&key) {
            Some(half) => half.tx.clone(),
            None => return false,
        };
        if tx.send_timeout(Bytes::new(), RELAY_TIMEOUT).await.is_err() {
            self.finish_relay(&session.agent_id, wire_id, false, false)
                .await;
        }
        true
    }

    /// Dismantle a relayed tunnel in both directions.
    ///
    /// `notify_origin` sends `Close` back to the session that opened the
    /// tunnel (false when that session sent the close itself or is gone);
    /// `graceful` lets a local socket drain its queue before shutdown.
    pub async fn finish_relay(
        &self,
        agent_id: &str,
        wire_id: u32,
        notify_origin: bool,
        graceful: bool,
    ) {
        let Some((_, half)) = self.relays.remove(&(agent_id.to_string(), wire_id)) else {
            return;
        };
        half.cancel();

        if let Some(session) = self.registry.get(agent_id) {
            session.untrack_tunnel(wire_id);
            if notify_origin {
                let _ = session.send_data(Frame::close(wire_id)).await;
            }
        }

        match half.dest {
            RelayDest::Local { tunnel_id } => {
                if graceful {
                    if let Some(entry) = self.tunnels.get(tunnel_id) {
                        entry.finish().await;
                    }
                }
                self.release_tunnel(tunnel_id, false).await;
            }
            RelayDest::Session {
                agent_id: peer_agent,
                tunnel_id: peer_id,
            } => {
                if let Some((_, peer_half)) = self.relays.remove(&(peer_agent.clone(), peer_id)) {
                    peer_half.cancel();
                }
                if let Some(peer_session) = self.registry.get(&peer_agent) {
                    peer_session.untrack_tunnel(peer_id);
                    let _ = peer_session.send_data(Frame::close(peer_id)).await;
                }
            }
        }
        debug!(agent_id, wire_id, "relay dismantled");
    }

    /// Whether a relay half exists for this (session, wire id) pair.
    pub fn has_relay(&self, agent_id: &str, wire_id: u32) -> bool {
        self.relays.contains_key(&(agent_id.to_string(), wire_id))
    }

    /// Connect handshakes currently awaiting their ack.
    pub fn pending_acks(&self) -> usize {
        self.pending.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, RuleKind};
    use chrono::Utc;

    fn components() -> Forwarder {
        Forwarder::new(
            Arc::new(MemStore::new()),
            AgentRegistry::new(),
            Arc::new(TunnelTable::new()),
            PendingAcks::new(),
            Arc::new(TrafficStats::new()),
        )
    }

    fn rule(id: &str, kind: RuleKind, proto: Proto) -> Rule {
        Rule {
            id: id.to_string(),
            name: format!("rule {id}"),
            kind,
            proto,
            source_agent_id: None,
            listen_port: 0,
            target_agent_id: Some("agent-a".to_string()),
            target_host: "127.0.0.1".to_string(),
            target_port: 1,
            enabled: true,
            rate_limit: 0,
            traffic_limit: 0,
            traffic_used: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_start_rule_twice_fails() {
        let fwd = components();
        fwd.start_rule(rule("r1", RuleKind::CloudToAgent, Proto::Tcp))
            .await
            .unwrap();
        assert!(matches!(
            fwd.start_rule(rule("r1", RuleKind::CloudToAgent, Proto::Tcp))
                .await,
            Err(ControlError::RuleAlreadyRunning(_))
        ));
        fwd.stop_rule("r1").await.unwrap();
        assert!(fwd.rule_state("r1").is_none());
    }

    #[tokio::test]
    async fn test_traffic_limit_trips() {
        let fwd = components();
        let mut r = rule("r1", RuleKind::CloudToAgent, Proto::Tcp);
        r.traffic_limit = 1000;
        let state = RuleState::new(r);

        assert!(fwd.add_traffic(&state, 900, Direction::Tx));
        assert!(!fwd.add_traffic(&state, 200, Direction::Tx));
        assert!(state.over_limit());
        assert_eq!(state.traffic_used(), 1100);
    }

    #[tokio::test]
    async fn test_traffic_counter_starts_from_stored_value() {
        let mut r = rule("r1", RuleKind::CloudToAgent, Proto::Tcp);
        r.traffic_used = 500;
        r.traffic_limit = 600;
        let state = RuleState::new(r);
        assert_eq!(state.traffic_used(), 500);
        assert!(!state.over_limit());
        state.traffic_used.fetch_add(100, Ordering::Relaxed);
        assert!(state.over_limit());
    }

    #[tokio::test]
    async fn test_stop_rule_flushes_traffic() {
        let store = Arc::new(MemStore::new());
        let fwd = Forwarder::new(
            store.clone(),
            AgentRegistry::new(),
            Arc::new(TunnelTable::new()),
            PendingAcks::new(),
            Arc::new(TrafficStats::new()),
        );

        let r = rule("r1", RuleKind::CloudToAgent, Proto::Tcp);
        store.create_rule(r.clone()).await.unwrap();
        fwd.start_rule(r).await.unwrap();

        let state = fwd.rule_state("r1").unwrap();
        fwd.add_traffic(&state, 4242, Direction::Tx);

        fwd.stop_rule("r1").await.unwrap();
        assert_eq!(store.get_rule("r1").await.unwrap().traffic_used, 4242);
    }

    #[tokio::test]
    async fn test_assignments_for_source_agent() {
        let fwd = components();

        let mut r = rule("r1", RuleKind::AgentToCloud, Proto::Tcp);
        r.source_agent_id = Some("agent-src".to_string());
        r.listen_port = 15000;
        fwd.start_rule(r).await.unwrap();

        let mut other = rule("r2", RuleKind::CloudToAgent, Proto::Tcp);
        other.listen_port = 0;
        fwd.start_rule(other).await.unwrap();

        let frames = fwd.assignments_for("agent-src");
        assert_eq!(frames.len(), 1);
        match &frames[0].message {
            Message::RuleAssign(spec) => {
                assert_eq!(spec.rule_id, "r1");
                assert_eq!(spec.listen_port, 15000);
            }
            other => panic!("expected RuleAssign, got {other:?}"),
        }
        assert!(fwd.assignments_for("someone-else").is_empty());
    }

    #[tokio::test]
    async fn test_restore_skips_disabled_rules() {
        let store = Arc::new(MemStore::new());
        let mut enabled = rule("on", RuleKind::CloudToAgent, Proto::Tcp);
        enabled.listen_port = 0;
        let mut disabled = rule("off", RuleKind::CloudToAgent, Proto::Tcp);
        disabled.enabled = false;
        store.create_rule(enabled).await.unwrap();
        store.create_rule(disabled).await.unwrap();

        let fwd = Forwarder::new(
            store,
            AgentRegistry::new(),
            Arc::new(TunnelTable::new()),
            PendingAcks::new(),
            Arc::new(TrafficStats::new()),
        );
        fwd.restore().await.unwrap();

        assert!(fwd.rule_state("on").is_some());
        assert!(fwd.rule_state("off").is_none());
    }
}
