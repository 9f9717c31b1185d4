//! The subset of the Kafka wire protocol served by the test broker

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const PRODUCE: i16 = 0;
pub const FETCH: i16 = 1;
pub const METADATA: i16 = 3;
pub const API_VERSIONS: i16 = 18;

/// Error code returned for an ApiVersions request newer than we speak
pub const UNSUPPORTED_VERSION: i16 = 35;

/// Advertised `(api key, min version, max version)`.
///
/// Fetch is only listed so clients enable v2 record batches; it is never
/// served.
pub const SUPPORTED_VERSIONS: &[(i16, i16, i16)] = &[
    (PRODUCE, 3, 7),
    (FETCH, 4, 4),
    (METADATA, 1, 4),
    (API_VERSIONS, 0, 3),
];

/// Whether `version` of `api_key` is in the advertised range
pub fn supports(api_key: i16, version: i16) -> bool {
    SUPPORTED_VERSIONS
        .iter()
        .any(|&(key, min, max)| key == api_key && (min..=max).contains(&version))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("invalid length {length} for {field}")]
    InvalidLength { field: &'static str, length: i64 },

    #[error("varint is too long")]
    VarintOverflow,

    #[error("bad record batch, magic byte is {0} not 2")]
    BadMagic(i8),

    #[error("compressed record batches are not supported (attributes {0:#x})")]
    Compressed(i16),

    #[error("unsupported api key {api_key} version {version}")]
    Unsupported { api_key: i16, version: i16 },

    #[error("invalid utf-8 in {0}")]
    InvalidString(&'static str),

    #[error("{0} overflows")]
    Overflow(&'static str),
}

type Result<T> = std::result::Result<T, ProtocolError>;

fn ensure(buf: &Bytes, n: usize, field: &'static str) -> Result<()> {
    if buf.remaining() < n {
        Err(ProtocolError::Truncated(field))
    } else {
        Ok(())
    }
}

/// Preallocation for an array of `count` entries. Every entry takes at least
/// one byte, so a count beyond what is left in `buf` is a lie.
fn capacity(buf: &Bytes, count: i32) -> usize {
    usize::try_from(count).unwrap_or(0).min(buf.remaining())
}

fn read_i8(buf: &mut Bytes, field: &'static str) -> Result<i8> {
    ensure(buf, 1, field)?;
    Ok(buf.get_i8())
}

fn read_i16(buf: &mut Bytes, field: &'static str) -> Result<i16> {
    ensure(buf, 2, field)?;
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut Bytes, field: &'static str) -> Result<i32> {
    ensure(buf, 4, field)?;
    Ok(buf.get_i32())
}

fn read_i64(buf: &mut Bytes, field: &'static str) -> Result<i64> {
    ensure(buf, 8, field)?;
    Ok(buf.get_i64())
}

fn take(buf: &mut Bytes, len: i64, field: &'static str) -> Result<Bytes> {
    let len = usize::try_from(len).map_err(|_| ProtocolError::InvalidLength { field, length: len })?;
    ensure(buf, len, field)?;
    Ok(buf.split_to(len))
}

fn read_nullable_string(buf: &mut Bytes, field: &'static str) -> Result<Option<String>> {
    let len = read_i16(buf, field)?;
    if len < 0 {
        return Ok(None);
    }
    let raw = take(buf, len.into(), field)?;
    String::from_utf8(raw.to_vec())
        .map(Some)
        .map_err(|_| ProtocolError::InvalidString(field))
}

fn read_string(buf: &mut Bytes, field: &'static str) -> Result<String> {
    read_nullable_string(buf, field)?.ok_or(ProtocolError::InvalidLength { field, length: -1 })
}

fn read_unsigned_varint(buf: &mut Bytes, field: &'static str) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        ensure(buf, 1, field)?;
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProtocolError::VarintOverflow)
}

/// Zig-zag encoded signed varint, as used inside record batches
fn read_varint(buf: &mut Bytes, field: &'static str) -> Result<i64> {
    let raw = read_unsigned_varint(buf, field)?;
    Ok((raw >> 1) as i64 ^ -((raw & 1) as i64))
}

fn read_varint_bytes(buf: &mut Bytes, field: &'static str) -> Result<Option<Bytes>> {
    let len = read_varint(buf, field)?;
    if len < 0 {
        return Ok(None);
    }
    take(buf, len, field).map(Some)
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_i16(s.len() as i16);
    out.put_slice(s.as_bytes());
}

fn put_unsigned_varint(out: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        out.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

/// Common request header. The v2 header's tagged fields, sent with flexible
/// ApiVersions requests, are left in the body since that body is never read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl RequestHeader {
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            api_key: read_i16(buf, "api key")?,
            api_version: read_i16(buf, "api version")?,
            correlation_id: read_i32(buf, "correlation id")?,
            client_id: read_nullable_string(buf, "client id")?,
        })
    }
}

/// Response body for an ApiVersions request of `version`
pub fn encode_api_versions(version: i16, out: &mut BytesMut) {
    if version > 3 {
        // Clients retry with v0 when told the version is unsupported
        out.put_i16(UNSUPPORTED_VERSION);
        out.put_i32(0);
        return;
    }

    out.put_i16(0);
    if version >= 3 {
        put_unsigned_varint(out, SUPPORTED_VERSIONS.len() as u64 + 1);
    } else {
        out.put_i32(SUPPORTED_VERSIONS.len() as i32);
    }
    for &(key, min, max) in SUPPORTED_VERSIONS {
        out.put_i16(key);
        out.put_i16(min);
        out.put_i16(max);
        if version >= 3 {
            put_unsigned_varint(out, 0);
        }
    }
    if version >= 1 {
        out.put_i32(0); // throttle_time_ms
    }
    if version >= 3 {
        put_unsigned_varint(out, 0);
    }
}

/// Topics named by a Metadata request, `None` for all topics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequest {
    pub topics: Option<Vec<String>>,
}

impl MetadataRequest {
    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let count = read_i32(buf, "metadata topic count")?;
        let topics = if count < 0 {
            None
        } else {
            let mut topics = Vec::with_capacity(capacity(buf, count));
            for _ in 0..count {
                topics.push(read_string(buf, "metadata topic")?);
            }
            Some(topics)
        };
        if version >= 4 {
            read_i8(buf, "allow auto topic creation")?;
        }
        Ok(Self { topics })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponse {
    pub broker: Broker,
    pub controller_id: i32,
    /// `(topic, partition count)`, every partition led by the single broker
    pub topics: Vec<(String, i32)>,
}

impl MetadataResponse {
    pub fn encode(&self, version: i16, out: &mut BytesMut) {
        if version >= 3 {
            out.put_i32(0); // throttle_time_ms
        }
        out.put_i32(1);
        out.put_i32(self.broker.node_id);
        put_string(out, &self.broker.host);
        out.put_i32(self.broker.port);
        out.put_i16(-1); // rack
        if version >= 2 {
            out.put_i16(-1); // cluster_id
        }
        out.put_i32(self.controller_id);

        out.put_i32(self.topics.len() as i32);
        for (topic, partitions) in &self.topics {
            out.put_i16(0);
            put_string(out, topic);
            out.put_u8(0); // is_internal
            out.put_i32(*partitions);
            for partition in 0..*partitions {
                out.put_i16(0);
                out.put_i32(partition);
                out.put_i32(self.broker.node_id);
                // replicas and isr
                out.put_i32(1);
                out.put_i32(self.broker.node_id);
                out.put_i32(1);
                out.put_i32(self.broker.node_id);
            }
        }
    }
}

/// One record of a v2 record batch. Headers are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp_delta: i64,
    pub offset_delta: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub last_offset_delta: i32,
    pub first_timestamp: i64,
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Decode every batch in a partition's record set
    pub fn decode_all(mut buf: Bytes) -> Result<Vec<Self>> {
        let mut batches = Vec::new();
        while buf.has_remaining() {
            let base_offset = read_i64(&mut buf, "batch base offset")?;
            let length = read_i32(&mut buf, "batch length")?;
            let body = take(&mut buf, length.into(), "record batch")?;
            batches.push(Self::decode(base_offset, body)?);
        }
        Ok(batches)
    }

    fn decode(base_offset: i64, mut buf: Bytes) -> Result<Self> {
        read_i32(&mut buf, "partition leader epoch")?;
        let magic = read_i8(&mut buf, "magic")?;
        if magic != 2 {
            return Err(ProtocolError::BadMagic(magic));
        }
        read_i32(&mut buf, "crc")?;
        let attributes = read_i16(&mut buf, "batch attributes")?;
        if attributes & 0x07 != 0 {
            return Err(ProtocolError::Compressed(attributes));
        }
        let last_offset_delta = read_i32(&mut buf, "last offset delta")?;
        let first_timestamp = read_i64(&mut buf, "first timestamp")?;
        read_i64(&mut buf, "max timestamp")?;
        read_i64(&mut buf, "producer id")?;
        read_i16(&mut buf, "producer epoch")?;
        read_i32(&mut buf, "base sequence")?;

        let count = read_i32(&mut buf, "record count")?;
        let mut records = Vec::with_capacity(capacity(&buf, count));
        for _ in 0..count {
            let length = read_varint(&mut buf, "record length")?;
            let mut record = take(&mut buf, length, "record")?;
            read_i8(&mut record, "record attributes")?;
            records.push(Record {
                timestamp_delta: read_varint(&mut record, "timestamp delta")?,
                offset_delta: read_varint(&mut record, "offset delta")?,
                key: read_varint_bytes(&mut record, "record key")?,
                value: read_varint_bytes(&mut record, "record value")?,
            });
        }

        Ok(Self {
            base_offset,
            last_offset_delta,
            first_timestamp,
            records,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionData {
    pub index: i32,
    pub batches: Vec<RecordBatch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicData {
    pub name: String,
    pub partitions: Vec<PartitionData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<TopicData>,
}

impl ProduceRequest {
    /// Decode a v3-v7 request
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let transactional_id = read_nullable_string(buf, "transactional id")?;
        let acks = read_i16(buf, "acks")?;
        let timeout_ms = read_i32(buf, "timeout")?;

        let topic_count = read_i32(buf, "topic count")?;
        let mut topics = Vec::with_capacity(capacity(buf, topic_count));
        for _ in 0..topic_count {
            let name = read_string(buf, "topic name")?;
            let partition_count = read_i32(buf, "partition count")?;
            let mut partitions = Vec::with_capacity(capacity(buf, partition_count));
            for _ in 0..partition_count {
                let index = read_i32(buf, "partition index")?;
                let length = read_i32(buf, "record set length")?;
                let batches = if length < 0 {
                    Vec::new()
                } else {
                    RecordBatch::decode_all(take(buf, length.into(), "record set")?)?
                };
                partitions.push(PartitionData { index, batches });
            }
            topics.push(TopicData { name, partitions });
        }

        Ok(Self {
            transactional_id,
            acks,
            timeout_ms,
            topics,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponse {
    /// `(topic, [(partition, base offset)])`
    pub topics: Vec<(String, Vec<(i32, i64)>)>,
}

impl ProduceResponse {
    pub fn encode(&self, version: i16, out: &mut BytesMut) {
        out.put_i32(self.topics.len() as i32);
        for (topic, partitions) in &self.topics {
            put_string(out, topic);
            out.put_i32(partitions.len() as i32);
            for &(index, base_offset) in partitions {
                out.put_i32(index);
                out.put_i16(0);
                out.put_i64(base_offset);
                out.put_i64(-1); // log_append_time_ms
                if version >= 5 {
                    out.put_i64(0); // log_start_offset
                }
            }
        }
        out.put_i32(0); // throttle_time_ms
    }
}
