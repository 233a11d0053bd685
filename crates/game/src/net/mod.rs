mod codec;
mod connection;
mod datagram;
mod protocol;
mod registry;

pub use codec::{DecodeError, FieldReader, FieldWriter, Record, WireValue};
pub use connection::{
    AuthError, AuthOutcome, AuthValidator, ChannelIdPool, Connection, DatagramSink, DeliveryError,
    Identity, PoolExhausted, ReliableSink, SharedSecretAuth,
};
pub use datagram::{ChannelKey, DatagramEnvelope, KEY_LEN, generate_key, obscure, rand_u64};
pub use protocol::{
    Authenticate, Authenticated, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION, Goodbye, MatchReady,
    Message, Notice, ObjectiveClaim, Ping, Pong, ProtocolError, StateEntry, StateUpdate, WIRE_ZERO,
};
pub use registry::ConnectionRegistry;
