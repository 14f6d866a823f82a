//! Transport Seam
//!
//! The driver does not own the radio. It consumes a narrow interface to the
//! platform BLE client: enable/disable the link node, request a connection,
//! look up connection-scoped characteristic handles, and submit asynchronous
//! reads/writes. Completions come back later as [`LinkEvent`]s delivered to
//! [`DeviceSession::handle_event`](super::session::DeviceSession::handle_event).
//!
//! The transport guarantees that operations on a single handle complete in
//! submission order. Completion order across different handles is not
//! guaranteed.

use thiserror::Error;
use uuid::Uuid;

/// Submission of a GATT operation failed before it left the host stack.
///
/// Not counted as outstanding — no completion event will follow. The next
/// periodic update cycle re-issues the work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("radio stack busy")]
    Busy,
    #[error("no active connection")]
    NotConnected,
    #[error("{0}")]
    Stack(String),
}

/// Status attached to a GATT completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    /// Raw stack status code.
    Error(u16),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

/// Events the transport delivers to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The physical link came up (informational; the session waits for
    /// service discovery before touching the device).
    Connected,
    /// Service discovery finished; characteristic handles can be resolved.
    ServicesResolved,
    /// The link went down, whether self- or device-initiated. Any in-flight
    /// request is implicitly cancelled.
    Disconnected { reason: u16 },
    ReadComplete {
        handle: u16,
        status: GattStatus,
        value: Vec<u8>,
    },
    WriteComplete {
        handle: u16,
        status: GattStatus,
    },
}

/// The narrow radio interface the session drives.
///
/// Submissions return immediately; the matching completion is delivered
/// later through the event channel, never from within the submitting call.
/// Disabling the node tears down any active link.
pub trait Transport {
    /// Stop any passive scan. Scanning interferes with connection attempts
    /// on the target platform.
    fn stop_scan(&mut self);

    fn set_enabled(&mut self, enabled: bool);
    fn is_enabled(&self) -> bool;

    /// Ask the stack to establish a link. Discovery completion is reported
    /// via [`LinkEvent::ServicesResolved`].
    fn request_connection(&mut self);

    /// Look up the connection-scoped handle for a characteristic in the
    /// discovered attribute table. Only valid between
    /// [`LinkEvent::ServicesResolved`] and the next disconnect.
    fn find_characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Option<u16>;

    /// Submit an asynchronous read for `handle`.
    fn read_characteristic(&mut self, handle: u16) -> Result<(), TransportError>;

    /// Submit an asynchronous acknowledged write for `handle`.
    fn write_characteristic(&mut self, handle: u16, value: &[u8]) -> Result<(), TransportError>;
}
