//! Command channel: one exchange at a time, typed status categories and
//! chunked data objects

use bytes::{Bytes, BytesMut};
use nexum_apdu_core::prelude::*;
use tracing::{Level, debug, info, instrument, trace, warn};

use crate::config::SessionConfig;
use crate::constants::{CLA, ins, tags};
use crate::{Error, Result, tlv};

/// GET RESPONSE rounds allowed for one reply
const MAX_GET_RESPONSE: usize = 64;

/// Failure reported by a status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    /// `67 00`
    WrongLength,
    /// `69 85`
    ConditionsNotSatisfied,
    /// `6A 80`
    IncorrectData,
    /// `6A 86` or `6B 00`
    IncorrectParameters,
    /// `6D 00` or `6A 81`
    NotSupported,
    /// Any other status word
    Unrecognized(StatusWord),
}

/// Outcome of an exchange as seen by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    /// `90 00`
    Success,
    /// Wrong PIN or PUK. Zero means the credential is now blocked.
    WrongValue {
        /// Attempts left on the token
        retries_remaining: u8,
    },
    /// Object or key reference not found
    NoData,
    /// Security status not satisfied
    AuthenticationRequired,
    /// Any other failure
    Failed(FailureCode),
}

impl StatusCategory {
    /// Fixed status word table
    pub const fn from_status(status: StatusWord) -> Self {
        if let Some(retries_remaining) = status.retries_remaining() {
            return Self::WrongValue { retries_remaining };
        }
        match (status.sw1, status.sw2) {
            (0x90, 0x00) => Self::Success,
            (0x69, 0x83) => Self::WrongValue { retries_remaining: 0 },
            (0x6A, 0x82) | (0x6A, 0x88) => Self::NoData,
            (0x69, 0x82) => Self::AuthenticationRequired,
            (0x67, 0x00) => Self::Failed(FailureCode::WrongLength),
            (0x69, 0x85) => Self::Failed(FailureCode::ConditionsNotSatisfied),
            (0x6A, 0x80) => Self::Failed(FailureCode::IncorrectData),
            (0x6A, 0x86) | (0x6B, 0x00) => Self::Failed(FailureCode::IncorrectParameters),
            (0x6D, 0x00) | (0x6A, 0x81) => Self::Failed(FailureCode::NotSupported),
            _ => Self::Failed(FailureCode::Unrecognized(status)),
        }
    }
}

/// A reply with its status already categorised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Category of `status`
    pub category: StatusCategory,
    /// Final status word, after any GET RESPONSE
    pub status: StatusWord,
    /// Reassembled data field
    pub payload: Bytes,
}

impl Reply {
    fn new(status: StatusWord, payload: Bytes) -> Self {
        Self {
            category: StatusCategory::from_status(status),
            status,
            payload,
        }
    }

    /// `90 00`
    pub const fn is_success(&self) -> bool {
        matches!(self.category, StatusCategory::Success)
    }

    /// Payload of a successful reply, otherwise the generic error for the category
    pub fn into_result(self) -> Result<Bytes> {
        if self.is_success() {
            Ok(self.payload)
        } else {
            Err(self.into_error())
        }
    }

    /// Generic error for a non-success reply. Callers that know which
    /// credential was involved map `WrongValue` themselves.
    pub fn into_error(self) -> Error {
        match self.category {
            StatusCategory::AuthenticationRequired => {
                Error::AuthenticationRequired("security status not satisfied")
            }
            StatusCategory::Failed(FailureCode::NotSupported) => {
                Error::Unsupported("instruction not supported by the token")
            }
            _ => Error::UnexpectedStatus(self.status),
        }
    }
}

/// Exclusive command channel over a transport
#[derive(Debug)]
pub struct CommandChannel<T: CardTransport> {
    transport: T,
    max_payload: usize,
    object_write_attempts: u8,
}

impl<T: CardTransport> CommandChannel<T> {
    /// Take over `transport`, applying the configured exchange timeout
    pub fn new(mut transport: T, config: &SessionConfig) -> Self {
        transport.set_timeout(config.exchange_timeout);
        Self {
            transport,
            max_payload: config.max_payload.max(1),
            object_write_attempts: config.object_write_attempts.max(1),
        }
    }

    /// Largest data field sent in one exchange
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Underlying transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give the transport back
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Send one command and collect the whole reply
    ///
    /// A data field above the maximum payload is answered locally with
    /// `Failed(WrongLength)`. `61 XX` replies are followed with GET RESPONSE.
    #[instrument(level = "trace", skip_all, fields(ins = command.ins))]
    pub fn exchange(&mut self, command: &Command) -> Result<Reply> {
        if command.data_len() > self.max_payload {
            debug!(
                len = command.data_len(),
                max = self.max_payload,
                "Command exceeds the maximum payload"
            );
            return Ok(Reply::new(status::WRONG_LENGTH, Bytes::new()));
        }
        let response = self.transport.transmit(command)?;
        self.collect(response)
    }

    /// Send a command split with ISO command chaining
    #[instrument(level = "trace", skip_all, fields(ins = command.ins))]
    pub fn exchange_chained(&mut self, command: &Command) -> Result<Reply> {
        let fragments = command.chain(self.max_payload);
        let count = fragments.len();
        trace!(fragments = count, "Sending chained command");

        let mut fragments = fragments.into_iter();
        while let Some(fragment) = fragments.next() {
            let response = self.transport.transmit(&fragment)?;
            if fragments.len() == 0 {
                return self.collect(response);
            }
            if !response.is_success() {
                debug!(status = %response.status(), "Chained fragment rejected");
                return Ok(Reply::new(response.status(), Bytes::new()));
            }
        }
        Err(Error::ProtocolViolation("empty command chain"))
    }

    fn collect(&mut self, mut response: Response) -> Result<Reply> {
        let mut payload = BytesMut::from(response.payload().as_ref());
        let mut rounds = 0;
        while let Some(remaining) = response.status().remaining_bytes() {
            rounds += 1;
            if rounds > MAX_GET_RESPONSE {
                warn!(received = payload.len(), "Token keeps announcing more data");
                return Err(Error::ProtocolViolation("too many GET RESPONSE rounds"));
            }
            let le = if remaining == 0 { 256 } else { u16::from(remaining) };
            trace!(remaining = le, "Fetching remaining response bytes");
            response = self
                .transport
                .transmit(&Command::new_with_le(CLA, ins::GET_RESPONSE, 0x00, 0x00, le))?;
            payload.extend_from_slice(response.payload());
        }

        let status = response.status();
        log_status(status);
        Ok(Reply::new(status, payload.freeze()))
    }

    /// Write a data object, clearing it when `value` is empty
    ///
    /// The whole write restarts from the first fragment after a transport
    /// failure, up to the configured number of attempts.
    #[instrument(level = "debug", skip_all, fields(object = id, len = value.len()))]
    pub fn write_object(&mut self, id: u32, value: &[u8]) -> Result<()> {
        let mut data = Vec::with_capacity(value.len() + 9);
        tlv::write(&mut data, &[tags::OBJECT_ID], &object_id(id));
        tlv::write(&mut data, &[tags::OBJECT_DATA], value);
        let command = Command::new_with_data(CLA, ins::PUT_DATA, 0x3F, 0xFF, data);

        let mut attempt = 1;
        loop {
            match self.exchange_chained(&command) {
                Ok(reply) => return reply.into_result().map(|_| ()),
                Err(Error::Transport(error)) if attempt < self.object_write_attempts => {
                    warn!(attempt, %error, "Object write interrupted, restarting");
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Read a data object. A missing object reads as empty.
    #[instrument(level = "debug", skip_all, fields(object = id))]
    pub fn read_object(&mut self, id: u32) -> Result<Bytes> {
        let mut data = Vec::with_capacity(5);
        tlv::write(&mut data, &[tags::OBJECT_ID], &object_id(id));
        let command = Command::new_with_data(CLA, ins::GET_DATA, 0x3F, 0xFF, data).with_le(256);

        let reply = self.exchange(&command)?;
        let payload = match reply.category {
            StatusCategory::Success => reply.payload,
            StatusCategory::NoData => return Ok(Bytes::new()),
            _ => return Err(reply.into_error()),
        };
        if payload.is_empty() {
            return Ok(payload);
        }

        let header = tlv::read_header(&payload)?
            .ok_or(Error::ProtocolViolation("truncated object header"))?;
        if payload[..header.tag_len] != [tags::OBJECT_DATA] {
            return Err(Error::ProtocolViolation("object is not wrapped in tag 53"));
        }
        if payload.len() < header.total_len() {
            debug!(
                declared = header.value_len,
                received = payload.len() - header.header_len,
                "Object shorter than declared"
            );
            return Err(Error::ProtocolViolation("object shorter than its declared length"));
        }
        Ok(payload.slice(header.header_len..header.total_len()))
    }
}

impl<T: CardTransport> CommandChannel<T> {
    /// Raw GET METADATA reply for a key reference, `None` when nothing is stored
    pub(crate) fn metadata(&mut self, reference: u8) -> Result<Option<Bytes>> {
        let command = Command::new_with_le(CLA, ins::GET_METADATA, 0x00, reference, 256);
        let reply = self.exchange(&command)?;
        match reply.category {
            StatusCategory::Success => Ok(Some(reply.payload)),
            StatusCategory::NoData => Ok(None),
            _ => Err(reply.into_error()),
        }
    }
}

/// Three byte object identifier
const fn object_id(id: u32) -> [u8; 3] {
    [(id >> 16) as u8, (id >> 8) as u8, id as u8]
}

fn log_status(status: StatusWord) {
    let level = status.tracing_level();
    if level == Level::DEBUG {
        debug!(%status, "Exchange complete");
    } else if level == Level::INFO {
        info!(%status, description = status.description(), "Exchange returned a warning");
    } else {
        warn!(%status, description = status.description(), "Exchange failed");
    }
}
