use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};

use vortex::{
    AuthError, AuthOutcome, AuthValidator, BucketOwner, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION,
    ChannelIdPool, Connection, ConnectionRegistry, DatagramEnvelope, DatagramSink, DeliveryError,
    GameplayMessage, HandlerCache, HandlerContext, Identity, MemoryStore, Message, MultiverseId,
    Notice, Pong, ReliableSink, Scheduler, SessionDirectory, SessionEvent, SessionSettings,
    SharedSecretAuth, StateStore, StateUpdate, StrategyRegistry, SyncEngine, default_table,
};

use crate::config::ServerConfig;

/// Frames queued for one connection's socket writer. A stalled client
/// fills its queue and starts losing frames instead of pinning server
/// memory until the idle sweep.
const SEND_QUEUE_DEPTH: usize = 256;

/// Reliable send path: frames go through a bounded per-connection
/// channel into the socket writer task, length-prefixed on the way out.
struct TcpSink {
    tx: mpsc::Sender<Vec<u8>>,
    closed: Arc<Notify>,
}

impl ReliableSink for TcpSink {
    fn send(&self, frame: &[u8]) -> Result<(), DeliveryError> {
        match self.tx.try_send(frame.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(DeliveryError::Send("send queue full".to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    fn close(&self) {
        self.closed.notify_one();
    }
}

/// Datagram send path over the shared UDP socket. Non-blocking; a full
/// send buffer just drops the datagram.
struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl DatagramSink for UdpSink {
    fn send_to(&self, addr: SocketAddr, datagram: &[u8]) -> Result<(), DeliveryError> {
        match self.socket.try_send_to(datagram, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(DeliveryError::Send(e.to_string())),
        }
    }
}

/// Whether a message arrived over the reliable or the datagram channel.
/// Replies go back the way the request came.
#[derive(Clone, Copy, PartialEq)]
enum Transport {
    Reliable,
    Datagram,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

pub struct GameServer {
    config: ServerConfig,
    directory: Arc<SessionDirectory>,
    store: Arc<dyn StateStore>,
    engine: Arc<SyncEngine>,
    registry: Arc<ConnectionRegistry>,
    handlers: HandlerCache,
    pool: ChannelIdPool,
    auth: Box<dyn AuthValidator>,
}

impl GameServer {
    pub fn new(config: ServerConfig) -> Self {
        let directory = Arc::new(SessionDirectory::new());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let engine = Arc::new(SyncEngine::new(Arc::clone(&store), Arc::clone(&directory)));
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&directory)));
        let handlers = HandlerCache::new(default_table(), Arc::clone(&store));
        let auth = Box::new(SharedSecretAuth::new(&config.secret));

        let server = Self {
            config,
            directory,
            store,
            engine,
            registry,
            handlers,
            pool: ChannelIdPool::new(),
            auth,
        };
        server.bootstrap_open_session();
        server
    }

    /// Provisions the auto-join session named in the config: one world,
    /// with state buckets at every granularity.
    fn bootstrap_open_session(&self) {
        let Some(multiverse) = self.config.open_session else {
            return;
        };
        let settings = SessionSettings {
            mode: self.config.open_session_mode.clone(),
            name: format!("open-{multiverse}"),
        };
        if !self.directory.create_session(multiverse, settings) {
            return;
        }
        let created = match self.directory.create_world(multiverse, 1, 1) {
            Ok(event) => event,
            Err(e) => {
                log::error!("open session bootstrap failed: {e}");
                return;
            }
        };
        self.store.create_bucket(BucketOwner::World(1));
        self.store.create_bucket(BucketOwner::Universe(1));
        self.store.create_bucket(BucketOwner::Multiverse(multiverse));
        self.apply_session_event(multiverse, &created);
        log::info!(
            "open session {multiverse} ready (mode {})",
            self.config.open_session_mode
        );
    }

    /// The session's rule set. Rebuilds after an invalidation go through
    /// the handler cache so a live handler's overrides are never lost.
    fn rules_for(&self, multiverse: MultiverseId) -> Arc<StrategyRegistry> {
        self.engine
            .strategies_for(multiverse, || self.handlers.layered_rules(multiverse))
    }

    fn ctx_for(&self, multiverse: MultiverseId) -> HandlerContext {
        HandlerContext {
            multiverse,
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            directory: Arc::clone(&self.directory),
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding tcp listener on {addr}"))?;
        let udp = Arc::new(
            UdpSocket::bind(&addr)
                .await
                .with_context(|| format!("binding udp socket on {addr}"))?,
        );
        log::info!("listening on {} (tcp+udp)", listener.local_addr()?);

        let udp_task = tokio::spawn(run_udp(Arc::clone(&self), Arc::clone(&udp)));
        let accept_task = {
            let server = Arc::clone(&self);
            let udp = Arc::clone(&udp);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((socket, peer)) => {
                            tokio::spawn(handle_connection(
                                Arc::clone(&server),
                                socket,
                                peer,
                                Arc::clone(&udp),
                            ));
                        }
                        Err(e) => log::warn!("accept failed: {e}"),
                    }
                }
            })
        };

        let idle_sweep = {
            let server = Arc::clone(&self);
            Scheduler::start("idle-sweep", self.config.sweep_interval, move || {
                server.sweep_idle_connections();
            })
        };
        let handler_sweep = {
            let server = Arc::clone(&self);
            Scheduler::start(
                "handler-sweep",
                self.config.handler_sweep_interval,
                move || {
                    let ctx_for = |mv| server.ctx_for(mv);
                    server.handlers.sweep(&ctx_for);
                },
            )
        };

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        log::info!("shutdown signal received");

        accept_task.abort();
        udp_task.abort();
        idle_sweep.stop();
        handler_sweep.stop();
        self.shutdown();
        Ok(())
    }

    fn sweep_idle_connections(&self) {
        for (player, conn) in self.registry.players_snapshot() {
            if conn.idle_for() > self.config.idle_timeout {
                log::info!("closing idle connection for player {player}");
                conn.close_with(CLOSE_GOING_AWAY, "idle timeout");
            }
        }
    }

    /// Graceful stop: everyone gets a notice and a coded goodbye, then
    /// every live handler is flushed to the store.
    fn shutdown(&self) {
        log::info!(
            "shutting down with {} connected players",
            self.registry.connected_players()
        );
        self.registry.broadcast_all(&Message::Notice(Notice {
            text: "server shutting down".to_string(),
        }));
        for (_, conn) in self.registry.players_snapshot() {
            conn.close_with(CLOSE_GOING_AWAY, "server shutting down");
        }
        let ctx_for = |mv| self.ctx_for(mv);
        self.handlers.shutdown(&ctx_for);
    }

    fn dispatch(&self, conn: &Arc<Connection>, message: Message, transport: Transport) -> Flow {
        match conn.identity() {
            Some(identity) => {
                self.dispatch_authenticated(conn, identity.player_id, message, transport)
            }
            None => self.dispatch_unauthenticated(conn, message),
        }
    }

    /// Before authentication exactly one message is acceptable.
    fn dispatch_unauthenticated(&self, conn: &Arc<Connection>, message: Message) -> Flow {
        let Message::Authenticate(auth) = message else {
            conn.close_with(CLOSE_POLICY_VIOLATION, "authenticate first");
            return Flow::Stop;
        };
        match conn.authenticate(&auth.token, self.auth.as_ref(), &self.pool) {
            Ok(AuthOutcome::Granted(identity)) => {
                self.post_auth(conn, &identity);
                Flow::Continue
            }
            Ok(AuthOutcome::AlreadyAuthenticated) => Flow::Continue,
            Err(AuthError::InvalidToken) => {
                conn.close_with(CLOSE_POLICY_VIOLATION, "invalid token");
                Flow::Stop
            }
            Err(e) => {
                log::error!("authentication failed: {e}");
                conn.close_with(CLOSE_GOING_AWAY, "authentication unavailable");
                Flow::Stop
            }
        }
    }

    fn post_auth(&self, conn: &Arc<Connection>, identity: &Identity) {
        let player = identity.player_id;
        self.registry.register_player(player, Arc::clone(conn));
        if let Some(id) = conn.channel_id() {
            self.registry.register_channel(id, Arc::clone(conn));
        }

        let mut joined = None;
        let multiverse = match self.directory.session_of(player) {
            Some(mv) => Some(mv),
            None => self.auto_join(player, &mut joined),
        };
        conn.bind_multiverse(multiverse);

        if let (Some(mv), Some(event)) = (multiverse, joined) {
            self.apply_session_event(mv, &event);
        }
        log::info!("player {player} ({}) authenticated", identity.name);
    }

    /// Every directory mutation the server performs goes through here:
    /// the cached rule set is dropped and the live handler hears about
    /// the change.
    fn apply_session_event(&self, multiverse: MultiverseId, event: &SessionEvent) {
        self.engine.invalidate(multiverse);
        self.notify_handler_event(multiverse, event);
    }

    /// Operator surface for poking a session's handler (admin tooling,
    /// debug consoles). The tag travels verbatim.
    pub fn emit_debug_event(&self, multiverse: MultiverseId, tag: &str) {
        let event = SessionEvent::Debug {
            multiverse,
            tag: tag.to_string(),
        };
        self.apply_session_event(multiverse, &event);
    }

    /// An explicit goodbye leaves the session; a plain socket drop keeps
    /// membership for a later reconnect.
    fn leave_session(&self, conn: &Arc<Connection>, player: u64) {
        let Some(multiverse) = self.directory.session_of(player) else {
            return;
        };
        conn.bind_multiverse(None);
        match self.directory.leave(multiverse, player) {
            Ok(event) => self.apply_session_event(multiverse, &event),
            Err(e) => log::warn!("player {player} leaving session {multiverse} failed: {e}"),
        }
    }

    fn auto_join(
        &self,
        player: u64,
        joined: &mut Option<SessionEvent>,
    ) -> Option<MultiverseId> {
        let multiverse = self.config.open_session?;
        let &(_, world) = self.directory.worlds(multiverse).first()?;
        match self.directory.join(multiverse, player, world) {
            Ok(event) => {
                *joined = Some(event);
                Some(multiverse)
            }
            Err(e) => {
                log::warn!("auto-join of player {player} failed: {e}");
                None
            }
        }
    }

    fn dispatch_authenticated(
        &self,
        conn: &Arc<Connection>,
        player: u64,
        message: Message,
        transport: Transport,
    ) -> Flow {
        match message {
            Message::Ping(ping) => {
                let pong = Message::Pong(Pong {
                    timestamp: ping.timestamp,
                });
                let result = match transport {
                    Transport::Reliable => conn.send(&pong),
                    Transport::Datagram => conn.send_datagram(&pong),
                };
                if let Err(e) = result {
                    log::debug!("pong to player {player} not delivered: {e}");
                }
                Flow::Continue
            }
            Message::Pong(_) => Flow::Continue,
            Message::StateUpdate(update) => {
                self.on_state_update(conn, player, update);
                Flow::Continue
            }
            Message::ObjectiveClaim(claim) => {
                self.on_gameplay(
                    conn,
                    player,
                    GameplayMessage::ObjectiveClaim {
                        objective_id: claim.objective_id,
                    },
                );
                Flow::Continue
            }
            Message::MatchReady(_) => {
                self.on_gameplay(conn, player, GameplayMessage::MatchReady);
                Flow::Continue
            }
            Message::Goodbye(goodbye) => {
                log::info!(
                    "player {player} said goodbye ({}: {})",
                    goodbye.code,
                    goodbye.reason
                );
                self.leave_session(conn, player);
                Flow::Stop
            }
            Message::Authenticate(auth) => {
                // re-auth on a live connection is ignored inside
                match conn.authenticate(&auth.token, self.auth.as_ref(), &self.pool) {
                    Ok(_) => Flow::Continue,
                    Err(e) => {
                        log::debug!("re-authentication rejected: {e}");
                        Flow::Continue
                    }
                }
            }
            Message::Authenticated(_) | Message::Notice(_) => {
                log::debug!("ignoring server-to-client message from player {player}");
                Flow::Continue
            }
        }
    }

    fn on_state_update(&self, conn: &Arc<Connection>, player: u64, update: StateUpdate) {
        let Some(multiverse) = conn.multiverse() else {
            log::debug!("state update from player {player} outside any session");
            return;
        };
        // the live handler installs its strategy overrides, so it must be
        // resolved before the rule set is cached
        if let Some(mode) = self.directory.mode(multiverse) {
            let ctx = self.ctx_for(multiverse);
            let _ = self.handlers.acquire(&ctx, &mode);
        }
        let rules = self.rules_for(multiverse);
        match self
            .engine
            .apply_entries(&rules, multiverse, player, &update.entries)
        {
            Ok(outcomes) => {
                if let Err(e) =
                    self.engine
                        .publish(&self.registry, multiverse, player, Some(conn), &outcomes)
                {
                    log::warn!("state publish for player {player} failed: {e}");
                }
            }
            Err(e) => {
                log::warn!("state update from player {player} rejected: {e}");
                let notice = Message::Notice(Notice {
                    text: format!("state update rejected: {e}"),
                });
                if let Err(e) = conn.send(&notice) {
                    log::debug!("rejection notice not delivered: {e}");
                }
            }
        }
    }

    fn on_gameplay(&self, conn: &Arc<Connection>, player: u64, message: GameplayMessage) {
        let Some(multiverse) = conn.multiverse() else {
            log::debug!("gameplay message from player {player} outside any session");
            return;
        };
        let Some(mode) = self.directory.mode(multiverse) else {
            log::warn!("session {multiverse} vanished underneath player {player}");
            return;
        };
        let ctx = self.ctx_for(multiverse);
        match self.handlers.acquire(&ctx, &mode) {
            Some(handler) => handler.lock().unwrap().handle_message(&ctx, player, &message),
            None => log::error!("session {multiverse} has unknown mode '{mode}'"),
        }
    }

    fn notify_handler_event(&self, multiverse: MultiverseId, event: &SessionEvent) {
        let Some(mode) = self.directory.mode(multiverse) else {
            return;
        };
        let ctx = self.ctx_for(multiverse);
        if let Some(handler) = self.handlers.acquire(&ctx, &mode) {
            handler.lock().unwrap().handle_event(&ctx, event);
        }
    }

    fn teardown(&self, conn: &Arc<Connection>) {
        if let Some(identity) = conn.identity() {
            self.registry.unregister_player(identity.player_id, conn);
            log::info!("player {} disconnected", identity.player_id);
        }
        if let Some(id) = conn.channel_id() {
            self.registry.unregister_channel(id);
        }
        conn.release_channel(&self.pool);
        self.registry.purge_observer(conn);
    }
}

async fn handle_connection(
    server: Arc<GameServer>,
    socket: TcpStream,
    peer: SocketAddr,
    udp: Arc<UdpSocket>,
) {
    if let Err(e) = socket.set_nodelay(true) {
        log::debug!("set_nodelay failed for {peer}: {e}");
    }
    let (mut reader, writer) = socket.into_split();
    let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    let closed = Arc::new(Notify::new());
    tokio::spawn(write_frames(writer, rx, Arc::clone(&closed)));

    let conn = Arc::new(Connection::new(
        Box::new(TcpSink { tx, closed }),
        Box::new(UdpSink { socket: udp }),
    ));
    log::info!("connection from {peer}");

    loop {
        let frame = match read_frame(&mut reader, server.config.max_frame_len).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                log::debug!("read from {peer} failed: {e}");
                break;
            }
        };
        conn.touch();

        let message = match Message::decode_envelope(&frame) {
            Ok(Some(message)) => message,
            // unknown message types are dropped, not fatal
            Ok(None) => continue,
            Err(e) => {
                log::warn!("malformed frame from {peer}: {e}");
                conn.close_with(CLOSE_POLICY_VIOLATION, "malformed frame");
                break;
            }
        };

        if server.dispatch(&conn, message, Transport::Reliable) == Flow::Stop {
            break;
        }
    }

    server.teardown(&conn);
}

/// Length-prefixed frame: u32 big-endian length, then the envelope.
/// `None` on a clean EOF at a frame boundary.
async fn read_frame(reader: &mut OwnedReadHalf, max_len: usize) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    closed: Arc<Notify>,
) {
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closed.notified() => break,
        };
        let len = frame.len() as u32;
        if writer.write_all(&len.to_be_bytes()).await.is_err() {
            break;
        }
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// The shared datagram socket. A connection's remote address is learned
/// from its latest inbound datagram; there is no datagram handshake.
async fn run_udp(server: Arc<GameServer>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                log::warn!("udp receive failed: {e}");
                continue;
            }
        };
        let Some(envelope) = DatagramEnvelope::decode(&buf[..len]) else {
            continue;
        };
        let Ok(channel_id) = u16::try_from(envelope.channel_id) else {
            continue;
        };
        let Some(conn) = server.registry.by_channel(channel_id) else {
            log::trace!("datagram from {addr} on unpaired channel {channel_id}");
            continue;
        };
        let Some(key) = conn.key() else {
            continue;
        };
        conn.observe_remote_addr(addr);
        conn.touch();

        let plain = envelope.unseal(&key);
        match Message::decode_envelope(&plain) {
            Ok(Some(message)) => {
                if let Some(identity) = conn.identity() {
                    server.dispatch_authenticated(
                        &conn,
                        identity.player_id,
                        message,
                        Transport::Datagram,
                    );
                }
            }
            Ok(None) => {}
            // a wrong key yields garbage; drop it quietly
            Err(e) => log::debug!("garbled datagram from {addr}: {e}"),
        }
    }
}
