//! Fixed-layout request and response records.
//!
//! A request occupies one request-region slot: the 16-byte key at the base,
//! then the value length and value bytes (PUT only), zero padding, and the
//! opcode byte in the slot's last position so an ascending-order remote
//! write publishes it last. The opcode byte doubles as the slot-occupancy
//! marker: zero is the idle sentinel.
//!
//! Opcode numbering requires `0 < GET < PUT < REMOTE_GET < REMOTE_PUT` with
//! `REMOTE_x = x + REMOTE_OPCODE_OFFSET`, so one comparison splits remote
//! from engine-local opcodes and a subtraction normalizes them.
use byteorder::{ByteOrder, LittleEndian};
use color_eyre::eyre::{bail, ensure, Result};
use drove_fabric::region::CACHE_LINE_SIZE;

pub const KEY_SIZE: usize = 16;

pub const SLOT_IDLE: u8 = 0;
pub const OPCODE_GET: u8 = 1;
pub const OPCODE_PUT: u8 = 2;
pub const REMOTE_OPCODE_OFFSET: u8 = 10;

/// Response length sentinel for a rejected (oversize) PUT.
pub const RESP_REJECTED: u8 = 0xFF;

/// A 128-bit key. The low 32 bits form the bucket field used for shard
/// routing and index bucket selection; the remaining bits disambiguate
/// collisions within a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
    #[inline]
    pub fn bucket(&self) -> u32 {
        LittleEndian::read_u32(&self.0[0..4])
    }

    /// The non-bucket bits folded to 64 for index storage.
    #[inline]
    pub fn tag(&self) -> u64 {
        LittleEndian::read_u64(&self.0[8..16]) ^ (LittleEndian::read_u32(&self.0[4..8]) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Get,
    Put,
}

impl Opcode {
    /// Engine-local opcode byte.
    pub fn engine_byte(&self) -> u8 {
        match self {
            Opcode::Get => OPCODE_GET,
            Opcode::Put => OPCODE_PUT,
        }
    }

    /// Opcode byte as written into a request slot by a remote client.
    pub fn remote_byte(&self) -> u8 {
        self.engine_byte() + REMOTE_OPCODE_OFFSET
    }
}

/// The slot-occupancy byte surfaced as state plus operation, so code paths
/// never open-code the idle sentinel comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Pending(Opcode),
}

impl SlotState {
    pub fn from_wire(byte: u8) -> Result<SlotState> {
        if byte == SLOT_IDLE {
            return Ok(SlotState::Idle);
        }
        // One comparison splits remote opcodes from engine-local ones.
        let engine_byte = if byte > OPCODE_PUT {
            match byte.checked_sub(REMOTE_OPCODE_OFFSET) {
                Some(b) => b,
                None => bail!("Malformed opcode byte {}", byte),
            }
        } else {
            byte
        };
        match engine_byte {
            OPCODE_GET => Ok(SlotState::Pending(Opcode::Get)),
            OPCODE_PUT => Ok(SlotState::Pending(Opcode::Put)),
            _ => bail!("Malformed opcode byte {}", byte),
        }
    }
}

/// Bytes a slot needs for a key, a value length, `max_value` value bytes and
/// the trailing opcode, rounded up to the cache line.
pub fn slot_size(max_value: usize) -> usize {
    let raw = KEY_SIZE + 1 + max_value + 1;
    (raw + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Value bytes a slot of `slot_size` bytes can carry.
pub fn slot_value_capacity(slot_size: usize) -> usize {
    slot_size - KEY_SIZE - 2
}

/// A request as a client encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord<'a> {
    pub opcode: Opcode,
    pub key: Key,
    pub value: Option<&'a [u8]>,
}

impl<'a> RequestRecord<'a> {
    /// Encode into a full slot buffer. The buffer is fully rewritten; the
    /// opcode lands in the last byte.
    pub fn encode_into(&self, slot: &mut [u8]) -> Result<()> {
        let len = slot.len();
        match self.opcode {
            Opcode::Get => ensure!(self.value.is_none(), "GET carries no value"),
            Opcode::Put => ensure!(self.value.is_some(), "PUT requires a value"),
        }
        let value = self.value.unwrap_or(&[]);
        ensure!(
            value.len() <= slot_value_capacity(len),
            "Value length {} exceeds slot capacity {}",
            value.len(),
            slot_value_capacity(len)
        );
        slot.fill(0);
        slot[0..KEY_SIZE].copy_from_slice(&self.key.0);
        slot[KEY_SIZE] = value.len() as u8;
        slot[KEY_SIZE + 1..KEY_SIZE + 1 + value.len()].copy_from_slice(value);
        slot[len - 1] = self.opcode.remote_byte();
        Ok(())
    }
}

/// A request as the worker decodes it from a pending slot's payload bytes
/// (everything below the opcode byte).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub opcode: Opcode,
    pub key: Key,
    pub value: Vec<u8>,
}

impl DecodedRequest {
    pub fn parse(opcode: Opcode, payload: &[u8]) -> Result<DecodedRequest> {
        ensure!(
            payload.len() >= KEY_SIZE + 1,
            "Slot payload too short: {}",
            payload.len()
        );
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&payload[0..KEY_SIZE]);
        let value = match opcode {
            Opcode::Get => Vec::new(),
            Opcode::Put => {
                let val_len = payload[KEY_SIZE] as usize;
                ensure!(
                    KEY_SIZE + 1 + val_len <= payload.len(),
                    "Value length {} exceeds slot payload",
                    val_len
                );
                payload[KEY_SIZE + 1..KEY_SIZE + 1 + val_len].to_vec()
            }
        };
        Ok(DecodedRequest {
            opcode,
            key: Key(key),
            value,
        })
    }
}

/// A response record: `val_len | val`. Empty responses answer misses and
/// PUT acks; the all-ones length marks a rejected PUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Empty,
    Rejected,
    Value(Vec<u8>),
}

impl Response {
    /// Largest encoding for the given value bound.
    pub fn max_encoded_len(max_value: usize) -> usize {
        1 + max_value
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Response::Empty => {
                buf[0] = 0;
                Ok(1)
            }
            Response::Rejected => {
                buf[0] = RESP_REJECTED;
                Ok(1)
            }
            Response::Value(val) => {
                ensure!(
                    val.len() < RESP_REJECTED as usize && val.len() + 1 <= buf.len(),
                    "Response value length {} unencodable",
                    val.len()
                );
                buf[0] = val.len() as u8;
                buf[1..1 + val.len()].copy_from_slice(val);
                Ok(1 + val.len())
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Response> {
        ensure!(!buf.is_empty(), "Empty response record");
        match buf[0] {
            0 => Ok(Response::Empty),
            RESP_REJECTED => Ok(Response::Rejected),
            len => {
                let len = len as usize;
                ensure!(1 + len <= buf.len(), "Response length {} truncated", len);
                Ok(Response::Value(buf[1..1 + len].to_vec()))
            }
        }
    }
}
