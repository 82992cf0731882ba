//! APDU command definitions
//!
//! This module provides the generic [`Command`] type and its ISO/IEC 7816-4
//! serialization, covering short and extended length encodings as well as
//! command chaining.

use bytes::{BufMut, Bytes, BytesMut};

use crate::Error;

/// Expected response length (Le). `256` encodes as `0x00` in a short APDU.
pub type ExpectedLength = u16;

/// Class byte bit signalling that more fragments of a chained command follow
pub const CLA_CHAINING: u8 = 0x10;

/// Largest data field a short APDU can carry
pub const SHORT_MAX_DATA: usize = 255;

/// Generic APDU command structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected length (optional)
    pub le: Option<ExpectedLength>,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self { cla, ins, p1, p2, data: None, le: None }
    }

    /// Create a new command with expected response length (Le)
    pub const fn new_with_le(cla: u8, ins: u8, p1: u8, p2: u8, le: ExpectedLength) -> Self {
        Self { cla, ins, p1, p2, data: None, le: Some(le) }
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self { cla, ins, p1, p2, data: Some(data.into()), le: None }
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: ExpectedLength) -> Self {
        self.le = Some(le);
        self
    }

    /// Length of the data field, zero when absent
    pub fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len)
    }

    /// Whether the chaining bit is set in the class byte
    pub const fn is_chained(&self) -> bool {
        self.cla & CLA_CHAINING != 0
    }

    /// Whether this command needs the extended length encoding
    pub fn is_extended(&self) -> bool {
        self.data_len() > SHORT_MAX_DATA || self.le.is_some_and(|le| le > 256)
    }

    /// Convert to raw APDU bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.command_length());

        // Header: CLA, INS, P1, P2
        buffer.put_u8(self.cla);
        buffer.put_u8(self.ins);
        buffer.put_u8(self.p1);
        buffer.put_u8(self.p2);

        let extended = self.is_extended();
        let data = self.data.as_deref().filter(|data| !data.is_empty());

        if let Some(data) = data {
            if extended {
                buffer.put_u8(0x00);
                buffer.put_u16(data.len() as u16);
            } else {
                buffer.put_u8(data.len() as u8);
            }
            buffer.put_slice(data);
        }

        if let Some(le) = self.le {
            if extended {
                if data.is_none() {
                    buffer.put_u8(0x00);
                }
                // 65536 wraps to 0x0000
                buffer.put_u16(le);
            } else {
                // 256 wraps to 0x00
                buffer.put_u8(le as u8);
            }
        }

        buffer.freeze()
    }

    /// Calculate length of serialized command
    pub fn command_length(&self) -> usize {
        let extended = self.is_extended();
        let data_len = self.data_len();
        let mut length = 4;

        if data_len > 0 {
            length += if extended { 3 } else { 1 } + data_len;
        }
        if self.le.is_some() {
            length += match (extended, data_len > 0) {
                (false, _) => 1,
                (true, true) => 2,
                (true, false) => 3,
            };
        }

        length
    }

    /// Split this command into a chain of commands whose data fields are at
    /// most `max_payload` bytes each.
    ///
    /// Every fragment except the last carries [`CLA_CHAINING`]. Only the last
    /// fragment keeps the expected length. A command that already fits is
    /// returned unchanged as a single-element chain.
    pub fn chain(&self, max_payload: usize) -> Vec<Self> {
        let max_payload = max_payload.max(1);
        let Some(data) = self.data.as_ref().filter(|data| data.len() > max_payload) else {
            return vec![self.clone()];
        };

        let count = data.len().div_ceil(max_payload);
        (0..count)
            .map(|index| {
                let start = index * max_payload;
                let end = (start + max_payload).min(data.len());
                let last = index + 1 == count;
                Self {
                    cla: if last { self.cla } else { self.cla | CLA_CHAINING },
                    ins: self.ins,
                    p1: self.p1,
                    p2: self.p2,
                    data: Some(data.slice(start..end)),
                    le: if last { self.le } else { None },
                }
            })
            .collect()
    }

    /// Parse a command from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 4 {
            return Err(Error::InvalidCommandLength(data.len()));
        }

        let mut command = Self::new(data[0], data[1], data[2], data[3]);
        let body = &data[4..];

        match body.len() {
            0 => {}
            1 => command.le = Some(short_le(body[0])),
            _ if body[0] == 0x00 && body.len() >= 3 => {
                // Extended encoding
                let word = u16::from_be_bytes([body[1], body[2]]);
                if body.len() == 3 {
                    command.le = Some(word);
                } else {
                    let lc = word as usize;
                    let rest = &body[3..];
                    if rest.len() == lc {
                        command.data = Some(Bytes::copy_from_slice(rest));
                    } else if rest.len() == lc + 2 {
                        command.data = Some(Bytes::copy_from_slice(&rest[..lc]));
                        command.le = Some(u16::from_be_bytes([rest[lc], rest[lc + 1]]));
                    } else {
                        return Err(Error::InvalidCommandLength(data.len()));
                    }
                }
            }
            _ => {
                let lc = body[0] as usize;
                let rest = &body[1..];
                if rest.len() == lc {
                    command.data = Some(Bytes::copy_from_slice(rest));
                } else if rest.len() == lc + 1 {
                    command.data = Some(Bytes::copy_from_slice(&rest[..lc]));
                    command.le = Some(short_le(rest[lc]));
                } else {
                    return Err(Error::InvalidCommandLength(data.len()));
                }
            }
        }

        Ok(command)
    }
}

const fn short_le(byte: u8) -> ExpectedLength {
    if byte == 0 { 256 } else { byte as ExpectedLength }
}
