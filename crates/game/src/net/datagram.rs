//! Datagram sub-envelope and channel key obfuscation.
//!
//! A datagram wraps one encoded message envelope: `{channel_id: i32 BE,
//! obscured: bytes}`. The obscured bytes are the envelope XORed against
//! the connection's repeating 16-byte key, so applying the same transform
//! twice is the identity. This is obfuscation, not authentication: trust
//! in a datagram derives solely from possession of the key handed out over
//! the already-authenticated reliable channel.

pub const KEY_LEN: usize = 16;

pub type ChannelKey = [u8; KEY_LEN];

/// XORs `data` in place against the repeating key. Symmetric: calling it
/// again with the same key restores the original bytes.
pub fn obscure(data: &mut [u8], key: &ChannelKey) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % KEY_LEN];
    }
}

pub fn generate_key() -> ChannelKey {
    let mut key = [0u8; KEY_LEN];
    key[..8].copy_from_slice(&rand_u64().to_le_bytes());
    key[8..].copy_from_slice(&rand_u64().to_le_bytes());
    key
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::Instant;

    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatagramEnvelope {
    pub channel_id: i32,
    pub obscured: Vec<u8>,
}

impl DatagramEnvelope {
    /// Wraps an already-encoded message envelope for the given channel.
    pub fn seal(channel_id: u16, envelope: Vec<u8>, key: &ChannelKey) -> Self {
        let mut obscured = envelope;
        obscure(&mut obscured, key);
        Self {
            channel_id: channel_id as i32,
            obscured,
        }
    }

    /// Recovers the inner message envelope bytes.
    pub fn unseal(mut self, key: &ChannelKey) -> Vec<u8> {
        obscure(&mut self.obscured, key);
        self.obscured
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.obscured.len());
        out.extend_from_slice(&self.channel_id.to_be_bytes());
        out.extend_from_slice(&self.obscured);
        out
    }

    /// `None` when the datagram is too short to carry a channel id.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        Some(Self {
            channel_id: i32::from_be_bytes(data[..4].try_into().unwrap()),
            obscured: data[4..].to_vec(),
        })
    }
}
