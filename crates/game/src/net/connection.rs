use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::session::{MultiverseId, PlayerId};

use super::datagram::{ChannelKey, DatagramEnvelope, generate_key};
use super::protocol::{Authenticated, Goodbye, Message};

/// Identity established by authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub player_id: PlayerId,
    pub name: String,
}

/// Token verification. JWT issuance lives outside this crate; deployments
/// plug their own validator in.
pub trait AuthValidator: Send + Sync {
    fn validate(&self, token: &str) -> Option<Identity>;
}

/// Accepts tokens of the form `<secret>:<player_id>:<name>`.
pub struct SharedSecretAuth {
    secret: String,
}

impl SharedSecretAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
        }
    }
}

impl AuthValidator for SharedSecretAuth {
    fn validate(&self, token: &str) -> Option<Identity> {
        let mut parts = token.splitn(3, ':');
        let secret = parts.next()?;
        if secret != self.secret {
            return None;
        }
        let player_id = parts.next()?.parse().ok()?;
        let name = parts.next()?;
        if name.is_empty() {
            return None;
        }
        Some(Identity {
            player_id,
            name: name.to_string(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, thiserror::Error)]
#[error("datagram channel id pool exhausted")]
pub struct PoolExhausted;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid bearer token")]
    InvalidToken,
    #[error(transparent)]
    Exhausted(#[from] PoolExhausted),
    #[error("failed to deliver auth reply: {0}")]
    Reply(#[from] DeliveryError),
}

/// Ordered persistent send path (the TCP side of a connection).
pub trait ReliableSink: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), DeliveryError>;
    fn close(&self);
}

/// Fire-and-forget datagram send path (the shared UDP socket).
pub trait DatagramSink: Send + Sync {
    fn send_to(&self, addr: SocketAddr, datagram: &[u8]) -> Result<(), DeliveryError>;
}

/// Bounded global pool of datagram channel ids (0..=65535). Allocation
/// and release are atomic; exhaustion surfaces as an error rather than
/// wrapping around onto a live id.
#[derive(Debug, Default)]
pub struct ChannelIdPool {
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Default)]
struct PoolInner {
    next: u32,
    free: Vec<u16>,
}

impl ChannelIdPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> Result<u16, PoolExhausted> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.free.pop() {
            return Ok(id);
        }
        if inner.next > u16::MAX as u32 {
            return Err(PoolExhausted);
        }
        let id = inner.next as u16;
        inner.next += 1;
        Ok(id)
    }

    pub fn release(&self, id: u16) {
        self.inner.lock().unwrap().free.push(id);
    }
}

#[derive(Debug, Default)]
struct ConnInner {
    identity: Option<Identity>,
    channel_id: Option<u16>,
    key: Option<ChannelKey>,
    remote_addr: Option<SocketAddr>,
    multiverse: Option<MultiverseId>,
}

pub enum AuthOutcome {
    Granted(Identity),
    /// Re-authentication on a live connection is ignored, not fatal.
    AlreadyAuthenticated,
}

/// One authenticated duplex session. Unauthenticated until the in-band
/// `Authenticate` message succeeds; the state transition is terminal for
/// the connection's lifetime.
pub struct Connection {
    reliable: Box<dyn ReliableSink>,
    datagram: Box<dyn DatagramSink>,
    inner: Mutex<ConnInner>,
    last_seen: Mutex<Instant>,
}

impl Connection {
    pub fn new(reliable: Box<dyn ReliableSink>, datagram: Box<dyn DatagramSink>) -> Self {
        Self {
            reliable,
            datagram,
            inner: Mutex::new(ConnInner::default()),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().unwrap().identity.is_some()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.lock().unwrap().identity.clone()
    }

    pub fn channel_id(&self) -> Option<u16> {
        self.inner.lock().unwrap().channel_id
    }

    pub fn key(&self) -> Option<ChannelKey> {
        self.inner.lock().unwrap().key
    }

    pub fn multiverse(&self) -> Option<MultiverseId> {
        self.inner.lock().unwrap().multiverse
    }

    pub fn bind_multiverse(&self, multiverse: Option<MultiverseId>) {
        self.inner.lock().unwrap().multiverse = multiverse;
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    /// Learns the remote datagram address from the latest inbound datagram
    /// bearing this connection's channel id. No handshake; a client-side
    /// NAT rebind simply shows up as a new address.
    pub fn observe_remote_addr(&self, addr: SocketAddr) {
        self.inner.lock().unwrap().remote_addr = addr.into();
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().remote_addr
    }

    /// Drives the Unauthenticated -> Authenticated transition. On success
    /// the connection owns a channel id and key and has already sent the
    /// `Authenticated` reply.
    pub fn authenticate(
        &self,
        token: &str,
        validator: &dyn AuthValidator,
        pool: &ChannelIdPool,
    ) -> Result<AuthOutcome, AuthError> {
        {
            let inner = self.inner.lock().unwrap();
            if let Some(identity) = &inner.identity {
                log::warn!(
                    "player {} attempted to re-authenticate; ignoring",
                    identity.player_id
                );
                return Ok(AuthOutcome::AlreadyAuthenticated);
            }
        }

        let identity = validator.validate(token).ok_or(AuthError::InvalidToken)?;
        let channel_id = pool.allocate()?;
        let key = generate_key();

        {
            let mut inner = self.inner.lock().unwrap();
            inner.identity = Some(identity.clone());
            inner.channel_id = Some(channel_id);
            inner.key = Some(key);
        }

        self.send(&Message::Authenticated(Authenticated {
            player_id: identity.player_id,
            name: identity.name.clone(),
            channel_id: channel_id as u32,
            key: key.to_vec(),
        }))?;

        Ok(AuthOutcome::Granted(identity))
    }

    /// Reliable ordered send over the persistent channel.
    pub fn send(&self, message: &Message) -> Result<(), DeliveryError> {
        self.reliable.send(&message.encode_envelope())
    }

    /// Best-effort datagram send. Silently dropped until a remote address
    /// has been observed for this connection's id; no queueing.
    pub fn send_datagram(&self, message: &Message) -> Result<(), DeliveryError> {
        let (channel_id, key, addr) = {
            let inner = self.inner.lock().unwrap();
            match (inner.channel_id, inner.key, inner.remote_addr) {
                (Some(id), Some(key), Some(addr)) => (id, key, addr),
                _ => {
                    log::trace!("datagram dropped: no paired remote address");
                    return Ok(());
                }
            }
        };
        let sealed = DatagramEnvelope::seal(channel_id, message.encode_envelope(), &key);
        self.datagram.send_to(addr, &sealed.encode())
    }

    /// Sends a coded close reason and shuts the reliable channel.
    pub fn close_with(&self, code: u32, reason: &str) {
        let goodbye = Message::Goodbye(Goodbye {
            code,
            reason: reason.to_string(),
        });
        if let Err(e) = self.send(&goodbye) {
            log::debug!("goodbye not delivered: {e}");
        }
        self.reliable.close();
    }

    /// Returns the channel id to the pool. Called once on teardown; any
    /// datagram still addressed to the released id is undeliverable.
    pub fn release_channel(&self, pool: &ChannelIdPool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.channel_id.take() {
            pool.release(id);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Connection")
            .field("identity", &inner.identity)
            .field("channel_id", &inner.channel_id)
            .field("multiverse", &inner.multiverse)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub frames: StdMutex<Vec<Vec<u8>>>,
        pub closed: StdMutex<bool>,
    }

    impl ReliableSink for Arc<RecordingSink> {
        fn send(&self, frame: &[u8]) -> Result<(), DeliveryError> {
            self.frames.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    pub(crate) struct NullDatagramSink;

    impl DatagramSink for NullDatagramSink {
        fn send_to(&self, _addr: SocketAddr, _datagram: &[u8]) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn test_connection() -> (Connection, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let conn = Connection::new(Box::new(Arc::clone(&sink)), Box::new(NullDatagramSink));
        (conn, sink)
    }

    #[test]
    fn shared_secret_token_parsing() {
        let auth = SharedSecretAuth::new("hunter2");
        let identity = auth.validate("hunter2:7:alice").unwrap();
        assert_eq!(identity.player_id, 7);
        assert_eq!(identity.name, "alice");

        assert!(auth.validate("wrong:7:alice").is_none());
        assert!(auth.validate("hunter2:notanumber:alice").is_none());
        assert!(auth.validate("hunter2:7:").is_none());
        assert!(auth.validate("hunter2").is_none());
    }

    #[test]
    fn successful_auth_assigns_channel_and_replies() {
        let (conn, sink) = test_connection();
        let auth = SharedSecretAuth::new("s");
        let pool = ChannelIdPool::new();

        let outcome = conn.authenticate("s:7:alice", &auth, &pool).unwrap();
        assert!(matches!(outcome, AuthOutcome::Granted(_)));
        assert!(conn.is_authenticated());
        assert!(conn.channel_id().is_some());
        assert!(conn.key().is_some());

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let reply = Message::decode_envelope(&frames[0]).unwrap().unwrap();
        match reply {
            Message::Authenticated(a) => {
                assert_eq!(a.player_id, 7);
                assert_eq!(a.key.len(), 16);
            }
            other => panic!("expected Authenticated, got {other:?}"),
        }
    }

    #[test]
    fn second_auth_is_ignored() {
        let (conn, sink) = test_connection();
        let auth = SharedSecretAuth::new("s");
        let pool = ChannelIdPool::new();

        conn.authenticate("s:7:alice", &auth, &pool).unwrap();
        let first_channel = conn.channel_id();
        let outcome = conn.authenticate("s:8:mallory", &auth, &pool).unwrap();
        assert!(matches!(outcome, AuthOutcome::AlreadyAuthenticated));
        assert_eq!(conn.channel_id(), first_channel);
        assert_eq!(sink.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn invalid_token_rejected() {
        let (conn, _) = test_connection();
        let auth = SharedSecretAuth::new("s");
        let pool = ChannelIdPool::new();
        assert!(matches!(
            conn.authenticate("bad:7:alice", &auth, &pool),
            Err(AuthError::InvalidToken)
        ));
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn datagram_dropped_without_remote_addr() {
        let (conn, _) = test_connection();
        let auth = SharedSecretAuth::new("s");
        let pool = ChannelIdPool::new();
        conn.authenticate("s:7:alice", &auth, &pool).unwrap();
        // no remote address observed yet: silently dropped, not an error
        conn.send_datagram(&Message::Ping(super::super::protocol::Ping { timestamp: 1 }))
            .unwrap();
    }

    #[test]
    fn pool_reuses_released_ids_and_exhausts() {
        let pool = ChannelIdPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        pool.release(a);
        assert_eq!(pool.allocate().unwrap(), a);

        let pool = ChannelIdPool::new();
        for _ in 0..=u16::MAX as u32 {
            pool.allocate().unwrap();
        }
        assert!(pool.allocate().is_err());
    }
}
