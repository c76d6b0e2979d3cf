//! # Record Codec
//!
//! Fixed-layout encoding of [`Record`] values. Every record on a channel
//! encodes to exactly [`RecordCodec::record_size`] bytes, so lanes can
//! preallocate their slots and the kernel probes can write the same bytes
//! straight from a `#[repr(C)]` [`EventRecord`].
//!
//! ## Layout (little-endian)
//!
//! ```text
//! offset  size  field
//!      0     4  subject_id
//!      4     4  process_id
//!      8     4  opcode
//!     12     2  payload_len
//!     14     2  reserved
//!     16    16  command_name (NUL padded)
//!     32   cap  payload (zero padded)
//! ```
//!
//! ## Truncation
//!
//! Encoding never fails. Over-capacity fields are cut silently:
//! - `command_name` keeps the text before its first NUL, then the longest
//!   prefix of at most 16 bytes that ends on a character boundary.
//! - `payload` keeps its first `cap` bytes.
//!
//! [`RecordCodec::truncate`] applies the same rule without encoding, so
//! `decode(encode(r)) == truncate(r)` for every record.

use std::borrow::Cow;

use tailtrace_common::{EventRecord, COMMAND_CAPACITY, HEADER_SIZE, PAYLOAD_CAPACITY};

use crate::domain::{CodecError, ConfigError};

/// Smallest payload capacity a channel may be configured with
pub const MIN_PAYLOAD_CAPACITY: usize = 32;

/// Largest payload capacity a channel may be configured with
pub const MAX_PAYLOAD_CAPACITY: usize = 128;

const SUBJECT_OFFSET: usize = 0;
const PROCESS_OFFSET: usize = 4;
const OPCODE_OFFSET: usize = 8;
const PAYLOAD_LEN_OFFSET: usize = 12;
const COMMAND_OFFSET: usize = HEADER_SIZE;
const PAYLOAD_OFFSET: usize = HEADER_SIZE + COMMAND_CAPACITY;

/// One traced event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Aggregation key, usually the user ID
    pub subject_id: u32,
    pub process_id: u32,
    pub command_name: String,
    /// Event kind or dispatch target
    pub opcode: u32,
    pub payload: Vec<u8>,
}

impl Record {
    #[must_use]
    pub fn new(opcode: u32, subject_id: u32, process_id: u32) -> Self {
        Self { subject_id, process_id, opcode, ..Self::default() }
    }

    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command_name = command.into();
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Payload interpreted as text, up to the first NUL
    #[must_use]
    pub fn payload_text(&self) -> Cow<'_, str> {
        let end = self.payload.iter().position(|&b| b == 0).unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end])
    }
}

impl From<&EventRecord> for Record {
    fn from(raw: &EventRecord) -> Self {
        let len = usize::from(raw.payload_len).min(PAYLOAD_CAPACITY);
        Self {
            subject_id: raw.subject_id,
            process_id: raw.process_id,
            command_name: command_from_bytes(&raw.command),
            opcode: raw.opcode,
            payload: raw.payload[..len].to_vec(),
        }
    }
}

/// Encoder/decoder for one channel's fixed record size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCodec {
    payload_capacity: usize,
}

impl Default for RecordCodec {
    /// The kernel probe layout
    fn default() -> Self {
        Self { payload_capacity: PAYLOAD_CAPACITY }
    }
}

impl RecordCodec {
    /// Create a codec for records carrying up to `payload_capacity` payload bytes
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidPayloadCapacity`] outside
    /// `MIN_PAYLOAD_CAPACITY..=MAX_PAYLOAD_CAPACITY`.
    pub fn new(payload_capacity: usize) -> Result<Self, ConfigError> {
        if !(MIN_PAYLOAD_CAPACITY..=MAX_PAYLOAD_CAPACITY).contains(&payload_capacity) {
            return Err(ConfigError::InvalidPayloadCapacity {
                capacity: payload_capacity,
                min: MIN_PAYLOAD_CAPACITY,
                max: MAX_PAYLOAD_CAPACITY,
            });
        }
        Ok(Self { payload_capacity })
    }

    #[must_use]
    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    /// Encoded size of every record on this channel
    #[must_use]
    pub fn record_size(&self) -> usize {
        PAYLOAD_OFFSET + self.payload_capacity
    }

    #[must_use]
    pub fn encode(&self, record: &Record) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.record_size());
        self.encode_into(record, &mut buf);
        buf
    }

    /// Encode into `buf`, replacing its contents
    ///
    /// Reuses the buffer's allocation; lanes encode straight into their slots.
    pub fn encode_into(&self, record: &Record, buf: &mut Vec<u8>) {
        buf.clear();
        buf.resize(self.record_size(), 0);

        let command = truncate_command(&record.command_name);
        let payload = &record.payload[..record.payload.len().min(self.payload_capacity)];

        write_u32_le(buf, SUBJECT_OFFSET, record.subject_id);
        write_u32_le(buf, PROCESS_OFFSET, record.process_id);
        write_u32_le(buf, OPCODE_OFFSET, record.opcode);
        // payload capacity is at most 128, always fits
        #[allow(clippy::cast_possible_truncation)]
        buf[PAYLOAD_LEN_OFFSET..PAYLOAD_LEN_OFFSET + 2]
            .copy_from_slice(&(payload.len() as u16).to_le_bytes());
        buf[COMMAND_OFFSET..COMMAND_OFFSET + command.len()].copy_from_slice(command.as_bytes());
        buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);
    }

    /// Decode one record
    ///
    /// # Errors
    /// Returns [`CodecError::LengthMismatch`] when `data` is not exactly
    /// `record_size()` bytes and [`CodecError::PayloadOverflow`] when the
    /// encoded payload length exceeds the channel capacity.
    pub fn decode(&self, data: &[u8]) -> Result<Record, CodecError> {
        if data.len() != self.record_size() {
            return Err(CodecError::LengthMismatch {
                expected: self.record_size(),
                actual: data.len(),
            });
        }

        let payload_len = usize::from(read_u16_le(data, PAYLOAD_LEN_OFFSET));
        if payload_len > self.payload_capacity {
            return Err(CodecError::PayloadOverflow {
                len: payload_len,
                capacity: self.payload_capacity,
            });
        }

        Ok(Record {
            subject_id: read_u32_le(data, SUBJECT_OFFSET),
            process_id: read_u32_le(data, PROCESS_OFFSET),
            command_name: command_from_bytes(&data[COMMAND_OFFSET..PAYLOAD_OFFSET]),
            opcode: read_u32_le(data, OPCODE_OFFSET),
            payload: data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload_len].to_vec(),
        })
    }

    /// The record as it will look after an encode/decode round trip
    #[must_use]
    pub fn truncate(&self, record: &Record) -> Record {
        Record {
            subject_id: record.subject_id,
            process_id: record.process_id,
            command_name: truncate_command(&record.command_name).to_owned(),
            opcode: record.opcode,
            payload: record.payload[..record.payload.len().min(self.payload_capacity)].to_vec(),
        }
    }
}

fn truncate_command(command: &str) -> &str {
    let command = command.split('\0').next().unwrap_or_default();
    let mut end = command.len().min(COMMAND_CAPACITY);
    while !command.is_char_boundary(end) {
        end -= 1;
    }
    &command[..end]
}

fn command_from_bytes(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

// Callers check lengths once up front; these index within bounds.

#[inline]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

#[inline]
fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::new(59, 501, 4242).with_command("bash").with_payload(b"Hello World".to_vec())
    }

    #[test]
    fn test_round_trip() {
        let codec = RecordCodec::default();
        let record = sample();
        let bytes = codec.encode(&record);
        assert_eq!(bytes.len(), 64);
        assert_eq!(codec.decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_layout_matches_kernel_struct() {
        let codec = RecordCodec::default();
        assert_eq!(codec.record_size(), std::mem::size_of::<EventRecord>());

        let bytes = codec.encode(&sample());
        assert_eq!(&bytes[0..4], &501u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &4242u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &59u32.to_le_bytes());
        assert_eq!(&bytes[12..14], &11u16.to_le_bytes());
        assert_eq!(&bytes[16..20], b"bash");
        assert_eq!(bytes[20], 0);
        assert_eq!(&bytes[32..43], b"Hello World");
    }

    #[test]
    fn test_trailing_zero_payload_survives() {
        let codec = RecordCodec::default();
        let record = Record::new(1, 0, 0).with_payload(vec![7, 0, 0]);
        assert_eq!(codec.decode(&codec.encode(&record)).unwrap().payload, vec![7, 0, 0]);
    }

    #[test]
    fn test_command_truncated_to_capacity() {
        let codec = RecordCodec::default();
        let record = sample().with_command("a-very-long-command-name");
        let decoded = codec.decode(&codec.encode(&record)).unwrap();
        assert_eq!(decoded.command_name, "a-very-long-comm");
        assert_eq!(decoded, codec.truncate(&record));
    }

    #[test]
    fn test_command_truncated_on_char_boundary() {
        let codec = RecordCodec::default();
        // 15 ASCII bytes followed by a 2-byte character straddling the limit
        let record = sample().with_command("abcdefghijklmnoé");
        let decoded = codec.decode(&codec.encode(&record)).unwrap();
        assert_eq!(decoded.command_name, "abcdefghijklmno");
    }

    #[test]
    fn test_command_cut_at_nul() {
        let codec = RecordCodec::default();
        let record = sample().with_command("cat\0hidden");
        let decoded = codec.decode(&codec.encode(&record)).unwrap();
        assert_eq!(decoded.command_name, "cat");
        assert_eq!(decoded, codec.truncate(&record));
    }

    #[test]
    fn test_payload_truncated_to_capacity() {
        let codec = RecordCodec::new(48).unwrap();
        let record = sample().with_payload(vec![0xAB; 100]);
        let decoded = codec.decode(&codec.encode(&record)).unwrap();
        assert_eq!(decoded.payload, vec![0xAB; 48]);
        assert_eq!(decoded, codec.truncate(&record));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let codec = RecordCodec::default();
        let mut bytes = codec.encode(&sample());
        bytes.pop();
        assert_eq!(
            codec.decode(&bytes),
            Err(CodecError::LengthMismatch { expected: 64, actual: 63 })
        );
        assert!(codec.decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_payload_len() {
        let codec = RecordCodec::default();
        let mut bytes = codec.encode(&sample());
        bytes[12..14].copy_from_slice(&33u16.to_le_bytes());
        assert_eq!(
            codec.decode(&bytes),
            Err(CodecError::PayloadOverflow { len: 33, capacity: 32 })
        );
    }

    #[test]
    fn test_invalid_payload_capacity() {
        assert!(RecordCodec::new(16).is_err());
        assert!(RecordCodec::new(129).is_err());
        assert!(RecordCodec::new(128).is_ok());
    }

    #[test]
    fn test_from_kernel_record() {
        let mut raw = EventRecord::zeroed();
        raw.subject_id = 0;
        raw.process_id = 77;
        raw.opcode = 59;
        raw.command[..2].copy_from_slice(b"ls");
        raw.payload[..9].copy_from_slice(b"Hey root!");
        raw.payload_len = 9;

        let record = Record::from(&raw);
        assert_eq!(record.command_name, "ls");
        assert_eq!(record.payload_text(), "Hey root!");
        assert_eq!(record.process_id, 77);
    }

    #[test]
    fn test_payload_text_stops_at_nul() {
        let record = Record::new(0, 0, 0).with_payload(b"hi\0there".to_vec());
        assert_eq!(record.payload_text(), "hi");
    }
}
