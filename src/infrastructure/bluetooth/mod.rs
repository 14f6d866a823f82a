//! Bluetooth Module
//!
//! BLE communication with the Danfoss Eco eTRV.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceSession                        │
//! │  (state machine - public API for the host component)     │
//! └───────┬──────────────┬──────────────┬───────────────────┘
//!         │              │              │
//!         ▼              ▼              ▼
//! ┌────────────┐  ┌────────────┐  ┌───────────┐
//! │   Queue    │  │ Properties │  │ Protocol  │
//! │            │  │            │  │           │
//! │ - pending  │  │ - handles  │  │ - UUIDs   │
//! │   reads/   │  │ - decoded  │  │ - payload │
//! │   writes   │  │   values   │  │   layouts │
//! └────────────┘  └────────────┘  └───────────┘
//!         │
//!         ▼
//! ┌────────────┐
//! │ Transport  │  (trait - the platform BLE client lives behind it)
//! └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers, wire layouts and payload codecs
//! - [`property`] - property descriptors and the handle table
//! - [`queue`] - FIFO of pending reads/writes
//! - [`transport`] - the narrow radio interface and its events
//! - [`session`] - connection/authentication state machine

pub mod property;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod transport;

// Re-export the session for convenience
pub use session::{DeviceSession, SessionState};

use thiserror::Error;
use uuid::Uuid;

use self::transport::TransportError;
use crate::infrastructure::crypto::CryptoError;

/// Driver-level failures. Everything here is local to one device session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    /// GATT submission failed; nothing is outstanding for it.
    #[error("transport submission failed: {0}")]
    Transport(#[from] TransportError),

    /// An expected characteristic is absent from the discovered attribute
    /// table. Fatal for the PIN and Settings characteristics, otherwise the
    /// property is simply unavailable this session.
    #[error("characteristic {characteristic} not found on the device")]
    CharacteristicMissing { characteristic: Uuid },

    /// Cipher rejected the operation; the decoded value is discarded.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Payload width did not match the property's fixed layout; the stored
    /// value is kept unchanged.
    #[error("unexpected {property} payload length: {actual}, expected {expected}")]
    Decode {
        property: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A write was requested for a property with nothing staged to send.
    #[error("{property} has no staged value to write")]
    NoStagedValue { property: &'static str },

    /// The device rejected the PIN write. Fatal for the session.
    #[error("device rejected pin write, status {0:#04x}")]
    AuthRejected(u16),
}
