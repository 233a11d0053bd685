use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vortex::{
    ChannelIdPool, Connection, ConnectionRegistry, DatagramEnvelope, DatagramSink, DeliveryError,
    GameplayMessage, HandlerCache, HandlerContext, MemoryStore, Message, NotifyRule,
    PlayerId, ReliableSink, SessionDirectory, SessionSettings, ShareScope, SharedSecretAuth,
    StateAddress, StateStore, StrategyRegistry, SyncEngine, SyncStrategy, default_registry,
    default_table, BucketOwner, MergeRule, CLOSE_POLICY_VIOLATION,
};

#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<Vec<u8>>>,
    closed: Mutex<bool>,
}

impl RecordingSink {
    fn messages(&self) -> Vec<Message> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| Message::decode_envelope(frame).unwrap())
            .collect()
    }
}

// Orphan rule forbids `impl ReliableSink for Arc<RecordingSink>` outside
// the defining crate, so the shared handle is wrapped in a local newtype.
struct SinkHandle(Arc<RecordingSink>);

impl ReliableSink for SinkHandle {
    fn send(&self, frame: &[u8]) -> Result<(), DeliveryError> {
        self.0.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn close(&self) {
        *self.0.closed.lock().unwrap() = true;
    }
}

#[derive(Default)]
struct RecordingDatagramSink {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

struct DatagramHandle(Arc<RecordingDatagramSink>);

impl DatagramSink for DatagramHandle {
    fn send_to(&self, addr: SocketAddr, datagram: &[u8]) -> Result<(), DeliveryError> {
        self.0.sent.lock().unwrap().push((addr, datagram.to_vec()));
        Ok(())
    }
}

struct Harness {
    directory: Arc<SessionDirectory>,
    store: Arc<MemoryStore>,
    engine: Arc<SyncEngine>,
    registry: Arc<ConnectionRegistry>,
    pool: ChannelIdPool,
    auth: SharedSecretAuth,
}

impl Harness {
    /// One session (multiverse 1), one universe (10), one world (100),
    /// with state buckets at every granularity.
    fn new() -> Self {
        let directory = Arc::new(SessionDirectory::new());
        directory.create_session(1, SessionSettings::default());
        directory.create_world(1, 10, 100).unwrap();

        let store = Arc::new(MemoryStore::new());
        store.create_bucket(BucketOwner::World(100));
        store.create_bucket(BucketOwner::Universe(10));
        store.create_bucket(BucketOwner::Multiverse(1));

        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            Arc::clone(&directory),
        ));
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&directory)));

        Self {
            directory,
            store,
            engine,
            registry,
            pool: ChannelIdPool::new(),
            auth: SharedSecretAuth::new("s"),
        }
    }

    /// Authenticated connection for `player`, joined to world 100 and
    /// registered as the player's active connection.
    fn connect(&self, player: PlayerId) -> (Arc<Connection>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let conn = Arc::new(Connection::new(
            Box::new(SinkHandle(Arc::clone(&sink))),
            Box::new(DatagramHandle(Arc::new(RecordingDatagramSink::default()))),
        ));
        let token = format!("s:{player}:p{player}");
        conn.authenticate(&token, &self.auth, &self.pool).unwrap();

        self.directory.join(1, player, 100).unwrap();
        conn.bind_multiverse(Some(1));
        self.registry.register_player(player, Arc::clone(&conn));
        sink.frames.lock().unwrap().clear();
        (conn, sink)
    }

    fn context(&self) -> HandlerContext {
        HandlerContext {
            multiverse: 1,
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            directory: Arc::clone(&self.directory),
        }
    }

    fn apply_and_publish(
        &self,
        rules: &StrategyRegistry,
        sender: PlayerId,
        conn: &Arc<Connection>,
        address: StateAddress,
        value: f64,
    ) {
        let outcome = self
            .engine
            .apply_update(rules, 1, sender, address, value)
            .unwrap();
        self.engine
            .publish(&self.registry, 1, sender, Some(conn), &[outcome])
            .unwrap();
    }
}

fn state_updates(messages: &[Message]) -> Vec<(ShareScope, String, f64)> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::StateUpdate(update) => Some(update),
            _ => None,
        })
        .flat_map(|update| {
            update
                .entries
                .iter()
                .map(|e| (update.scope, format!("{}/{}", e.group, e.name), e.value()))
        })
        .collect()
}

#[test]
fn test_max_different_broadcast_and_correction() {
    let harness = Harness::new();
    let (conn_a, sink_a) = harness.connect(1);
    let (conn_b, sink_b) = harness.connect(2);
    let rules = default_registry();
    let address = StateAddress::new("score", "best");

    // first value improves the record: everyone else hears it, sender
    // gets no echo (merged == sent)
    harness.apply_and_publish(&rules, 1, &conn_a, address.clone(), 10.0);
    assert!(sink_a.messages().is_empty());
    assert_eq!(
        state_updates(&sink_b.messages()),
        vec![(ShareScope::Multiverse, "score/best".into(), 10.0)]
    );

    // a worse value from B is corrected back to B alone; A hears nothing
    sink_b.frames.lock().unwrap().clear();
    harness.apply_and_publish(&rules, 2, &conn_b, address.clone(), 5.0);
    assert!(sink_a.messages().is_empty());
    assert_eq!(
        state_updates(&sink_b.messages()),
        vec![(ShareScope::Player, "score/best".into(), 10.0)]
    );

    assert_eq!(
        harness
            .store
            .read(BucketOwner::Multiverse(1), &address)
            .unwrap(),
        Some(10.0)
    );
}

#[test]
fn test_world_scope_overwrite_reaches_world_members_only() {
    let harness = Harness::new();
    harness.directory.create_world(1, 10, 101).unwrap();
    let (conn_a, _sink_a) = harness.connect(1);
    let (_conn_b, sink_b) = harness.connect(2);

    // player 3 lives in a different world of the same universe
    let sink_c = Arc::new(RecordingSink::default());
    let conn_c = Arc::new(Connection::new(
        Box::new(SinkHandle(Arc::clone(&sink_c))),
        Box::new(DatagramHandle(Arc::new(RecordingDatagramSink::default()))),
    ));
    conn_c
        .authenticate("s:3:p3", &harness.auth, &harness.pool)
        .unwrap();
    harness.directory.join(1, 3, 101).unwrap();
    conn_c.bind_multiverse(Some(1));
    harness.registry.register_player(3, Arc::clone(&conn_c));
    sink_c.frames.lock().unwrap().clear();

    let rules = default_registry();
    harness.apply_and_publish(&rules, 1, &conn_a, StateAddress::new("score", "total"), 3.0);

    assert_eq!(
        state_updates(&sink_b.messages()),
        vec![(ShareScope::World, "score/total".into(), 3.0)]
    );
    assert!(sink_c.messages().is_empty());
}

#[test]
fn test_silent_strategy_persists_without_traffic() {
    let harness = Harness::new();
    let (conn_a, sink_a) = harness.connect(1);
    let (_conn_b, sink_b) = harness.connect(2);

    let address = StateAddress::new("telemetry", "distance");
    let mut rules = StrategyRegistry::new();
    rules.insert(
        address.clone(),
        SyncStrategy::silent(MergeRule::Max, ShareScope::World),
    );

    harness.apply_and_publish(&rules, 1, &conn_a, address.clone(), 80.5);
    assert!(sink_a.messages().is_empty());
    assert!(sink_b.messages().is_empty());
    assert_eq!(
        harness.store.read(BucketOwner::World(100), &address).unwrap(),
        Some(80.5)
    );
}

#[test]
fn test_unknown_address_is_persisted_nowhere() {
    let harness = Harness::new();
    let (conn_a, _) = harness.connect(1);
    let rules = default_registry();
    let address = StateAddress::new("mystery", "value");
    harness.apply_and_publish(&rules, 1, &conn_a, address.clone(), 1.0);
    assert_eq!(
        harness.store.read(BucketOwner::World(100), &address).unwrap(),
        None
    );
}

#[test]
fn test_policy_violation_close_sends_coded_goodbye() {
    let harness = Harness::new();
    let sink = Arc::new(RecordingSink::default());
    let conn = Connection::new(
        Box::new(SinkHandle(Arc::clone(&sink))),
        Box::new(DatagramHandle(Arc::new(RecordingDatagramSink::default()))),
    );
    // unauthenticated connections get a coded close, not silence
    conn.close_with(CLOSE_POLICY_VIOLATION, "authenticate first");

    let messages = sink.messages();
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        Message::Goodbye(g) => {
            assert_eq!(g.code, CLOSE_POLICY_VIOLATION);
            assert_eq!(g.reason, "authenticate first");
        }
        other => panic!("expected Goodbye, got {other:?}"),
    }
    assert!(*sink.closed.lock().unwrap());
}

#[test]
fn test_datagram_pairing_round_trip() {
    let harness = Harness::new();
    let datagram_sink = Arc::new(RecordingDatagramSink::default());
    let reliable = Arc::new(RecordingSink::default());
    let conn = Arc::new(Connection::new(
        Box::new(SinkHandle(Arc::clone(&reliable))),
        Box::new(DatagramHandle(Arc::clone(&datagram_sink))),
    ));
    conn.authenticate("s:1:p1", &harness.auth, &harness.pool)
        .unwrap();

    let channel_id = conn.channel_id().unwrap();
    harness.registry.register_channel(channel_id, Arc::clone(&conn));

    // first inbound datagram pairs the remote address
    let addr: SocketAddr = "10.0.0.7:4242".parse().unwrap();
    let found = harness.registry.by_channel(channel_id).unwrap();
    found.observe_remote_addr(addr);

    found
        .send_datagram(&Message::Pong(vortex::Pong { timestamp: 99 }))
        .unwrap();

    let sent = datagram_sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, addr);

    let envelope = DatagramEnvelope::decode(&sent[0].1).unwrap();
    assert_eq!(envelope.channel_id, channel_id as i32);
    let plain = envelope.unseal(&conn.key().unwrap());
    match Message::decode_envelope(&plain).unwrap().unwrap() {
        Message::Pong(p) => assert_eq!(p.timestamp, 99),
        other => panic!("expected Pong, got {other:?}"),
    }
}

#[test]
fn test_race_survives_eviction_and_restores_mid_ready() {
    let harness = Harness::new();
    let (_conn_a, sink_a) = harness.connect(1);
    let (_conn_b, _sink_b) = harness.connect(2);
    let ctx = harness.context();
    let store = Arc::clone(&harness.store) as Arc<dyn StateStore>;

    let cache = HandlerCache::with_ttl(default_table(), Arc::clone(&store), Duration::ZERO);
    {
        let handler = cache.acquire(&ctx, "race").unwrap();
        handler
            .lock()
            .unwrap()
            .handle_message(&ctx, 1, &GameplayMessage::MatchReady);
    }
    // only one of two players is ready: the handler is idle-evictable
    let sweep_ctx = ctx.clone();
    cache.sweep(&move |_| sweep_ctx.clone());
    assert_eq!(cache.live_count(), 0);
    assert!(store.load_snapshot(1, "race").unwrap().is_some());

    // a fresh acquire restores the ready set; the second ready starts
    // the race
    let handler = cache.acquire(&ctx, "race").unwrap();
    handler
        .lock()
        .unwrap()
        .handle_message(&ctx, 2, &GameplayMessage::MatchReady);

    let started = sink_a.messages().iter().any(|m| match m {
        Message::Notice(n) => n.text.contains("race started"),
        _ => false,
    });
    assert!(started, "expected a race-started notice after both readies");

    let mut guard = handler.lock().unwrap();
    guard.stop(&ctx);
    assert!(guard.is_disposable());
}

#[test]
fn test_race_overrides_take_effect_through_the_engine() {
    let harness = Harness::new();
    let ctx = harness.context();
    let store = Arc::clone(&harness.store) as Arc<dyn StateStore>;
    let cache = HandlerCache::new(default_table(), store);

    cache.acquire(&ctx, "race").unwrap();

    // the cached rule set now carries the race amendments
    let rules = harness.engine.strategies_for(1, default_registry);
    let progress = rules
        .get(&StateAddress::new("race", "progress"))
        .copied()
        .unwrap();
    assert_eq!(progress.notify, NotifyRule::None);
    assert_eq!(progress.scope, ShareScope::Universe);
}
