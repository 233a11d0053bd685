pub mod handler;
pub mod net;
pub mod scheduler;
pub mod session;
pub mod sync;

pub use handler::{
    FreeplayHandler, GameplayMessage, HandlerCache, HandlerContext, HandlerTable, RaceHandler,
    SessionHandler, SharedHandler, SnapshotError, default_table,
};
pub use net::{
    AuthError, AuthOutcome, AuthValidator, Authenticate, Authenticated, CLOSE_GOING_AWAY,
    CLOSE_POLICY_VIOLATION, ChannelIdPool, ChannelKey, Connection, ConnectionRegistry,
    DatagramEnvelope, DatagramSink, DeliveryError, Goodbye, Identity, MatchReady, Message, Notice,
    ObjectiveClaim, Ping, Pong, PoolExhausted, ProtocolError, ReliableSink, SharedSecretAuth,
    StateEntry, StateUpdate,
};
pub use scheduler::Scheduler;
pub use session::{
    ConsistencyError, MultiverseId, PlayerId, SessionDirectory, SessionEvent, SessionSettings,
    UniverseId, WorldId,
};
pub use sync::{
    AdmitRule, BucketOwner, EngineError, MemoryStore, MergeRule, NotifyRule, ShareScope,
    StateAddress, StateStore, StoreError, StrategyRegistry, SyncEngine, SyncStrategy,
    UpdateOutcome, default_registry,
};
