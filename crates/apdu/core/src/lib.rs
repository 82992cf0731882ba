//! Core traits and types for APDU (Application Protocol Data Unit) operations
//!
//! This crate provides the foundational types for exchanging ISO/IEC 7816-4
//! command and response APDUs with a smart card:
//!
//! - [`Command`] encoding, including command chaining for payloads larger than
//!   a single exchange allows
//! - [`Response`] parsing and [`StatusWord`] interpretation
//! - the [`CardTransport`] trait implemented by physical or simulated readers
//!
//! Anything above raw APDUs (status categories, credential handling, object
//! storage) lives in the application crates built on top of this one.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod command;
pub mod error;
pub mod response;
pub mod transport;

pub use command::{CLA_CHAINING, Command, ExpectedLength};
pub use error::{Error, Result};
pub use response::Response;
pub use response::status::StatusWord;
pub use transport::{CardTransport, TransportError};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::response::status::{StatusWord, common as status};
    pub use crate::transport::{CardTransport, TransportError};
    pub use crate::{Bytes, BytesMut, Command, Error, ExpectedLength, Response};
}
