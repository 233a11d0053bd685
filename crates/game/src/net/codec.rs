//! Numbered-field record encoding for protocol payloads.
//!
//! Every payload is a flat record whose fields carry explicit numbers. A
//! field is written as a varint tag `(field << 3) | wire_type` followed by
//! the value. Readers skip tags they do not recognize and leave unset
//! fields at their defaults, so peers on different protocol revisions can
//! still talk to each other.

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_BYTES: u8 = 2;

const MAX_VARINT_BYTES: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated payload")]
    Truncated,
    #[error("varint overflow")]
    VarintOverflow,
    #[error("unknown wire type {0}")]
    UnknownWireType(u8),
    #[error("invalid utf-8 in string field {0}")]
    InvalidString(u32),
    #[error("invalid value in field {field}: {reason}")]
    InvalidValue { field: u32, reason: &'static str },
}

#[derive(Debug, Clone, Copy)]
pub enum WireValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
}

impl<'a> WireValue<'a> {
    pub fn as_u64(&self) -> u64 {
        match self {
            WireValue::Varint(v) | WireValue::Fixed64(v) => *v,
            WireValue::Bytes(_) => 0,
        }
    }

    pub fn as_u32(&self) -> u32 {
        self.as_u64() as u32
    }

    pub fn as_bool(&self) -> bool {
        self.as_u64() != 0
    }

    pub fn as_i64(&self) -> i64 {
        zigzag_decode(self.as_u64())
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            WireValue::Fixed64(bits) => f64::from_bits(*bits),
            WireValue::Varint(v) => *v as f64,
            WireValue::Bytes(_) => 0.0,
        }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        match self {
            WireValue::Bytes(b) => b,
            _ => &[],
        }
    }

    pub fn as_str(&self, field: u32) -> Result<&'a str, DecodeError> {
        std::str::from_utf8(self.as_bytes()).map_err(|_| DecodeError::InvalidString(field))
    }
}

/// Serializes one record. Default-valued fields are skipped entirely,
/// which is what lets decoders treat absence as the default.
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u64(&mut self, field: u32, value: u64) {
        if value == 0 {
            return;
        }
        self.tag(field, WIRE_VARINT);
        self.varint(value);
    }

    pub fn write_u32(&mut self, field: u32, value: u32) {
        self.write_u64(field, value as u64);
    }

    pub fn write_bool(&mut self, field: u32, value: bool) {
        self.write_u64(field, value as u64);
    }

    pub fn write_i64(&mut self, field: u32, value: i64) {
        if value == 0 {
            return;
        }
        self.tag(field, WIRE_VARINT);
        self.varint(zigzag_encode(value));
    }

    pub fn write_f64(&mut self, field: u32, value: f64) {
        if value == 0.0 {
            return;
        }
        self.tag(field, WIRE_FIXED64);
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    pub fn write_str(&mut self, field: u32, value: &str) {
        self.write_bytes(field, value.as_bytes());
    }

    pub fn write_bytes(&mut self, field: u32, value: &[u8]) {
        if value.is_empty() {
            return;
        }
        self.tag(field, WIRE_BYTES);
        self.varint(value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    /// Nested record, length-delimited. Written even when empty so
    /// repeated fields keep their element count.
    pub fn write_record(&mut self, field: u32, encode: impl FnOnce(&mut FieldWriter)) {
        let mut nested = FieldWriter::new();
        encode(&mut nested);
        self.tag(field, WIRE_BYTES);
        self.varint(nested.buf.len() as u64);
        self.buf.extend_from_slice(&nested.buf);
    }

    fn tag(&mut self, field: u32, wire_type: u8) {
        self.varint(((field as u64) << 3) | wire_type as u64);
    }

    fn varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
    }
}

/// Walks the fields of one encoded record in order.
#[derive(Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next `(field_number, value)` pair, or `None` at end of input.
    pub fn next_field(&mut self) -> Result<Option<(u32, WireValue<'a>)>, DecodeError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let tag = self.varint()?;
        let field = (tag >> 3) as u32;
        let value = match (tag & 0x7) as u8 {
            WIRE_VARINT => WireValue::Varint(self.varint()?),
            WIRE_FIXED64 => {
                let bytes = self.take(8)?;
                WireValue::Fixed64(u64::from_le_bytes(bytes.try_into().unwrap()))
            }
            WIRE_BYTES => {
                let len = self.varint()? as usize;
                WireValue::Bytes(self.take(len)?)
            }
            other => return Err(DecodeError::UnknownWireType(other)),
        };
        Ok(Some((field, value)))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < len {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        let mut shift = 0;
        for _ in 0..MAX_VARINT_BYTES {
            let Some(&byte) = self.buf.get(self.pos) else {
                return Err(DecodeError::Truncated);
            };
            self.pos += 1;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
        Err(DecodeError::VarintOverflow)
    }
}

/// A payload that knows how to lay out its numbered fields.
pub trait Record: Default {
    fn encode_fields(&self, w: &mut FieldWriter);

    /// Applies one decoded field. Unknown field numbers must be ignored.
    fn apply_field(&mut self, field: u32, value: WireValue<'_>) -> Result<(), DecodeError>;

    fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        self.encode_fields(&mut w);
        w.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut record = Self::default();
        let mut reader = FieldReader::new(bytes);
        while let Some((field, value)) = reader.next_field()? {
            record.apply_field(field, value)?;
        }
        Ok(record)
    }
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
