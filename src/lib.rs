//! Driver for the Danfoss Eco eTRV Bluetooth Low-Energy radiator
//! thermostat.
//!
//! The crate authenticates against the device with its PIN handshake,
//! decrypts/encrypts the proprietary XXTEA-framed wire format, and turns
//! GATT characteristic values into thermostat state (and back). The radio
//! itself is not part of the crate: the host supplies a [`Transport`]
//! implementation for its BLE stack and forwards link events into the
//! session.
//!
//! # Quick Start
//!
//! ```no_run
//! use danfoss_eco::{ControlRequest, DeviceConfig, DeviceSession, LinkEvent};
//! # struct MyTransport;
//! # impl danfoss_eco::Transport for MyTransport {
//! #     fn stop_scan(&mut self) {}
//! #     fn set_enabled(&mut self, _enabled: bool) {}
//! #     fn is_enabled(&self) -> bool { true }
//! #     fn request_connection(&mut self) {}
//! #     fn find_characteristic(&self, _s: &uuid::Uuid, _c: &uuid::Uuid) -> Option<u16> { None }
//! #     fn read_characteristic(&mut self, _h: u16) -> Result<(), danfoss_eco::TransportError> { Ok(()) }
//! #     fn write_characteristic(&mut self, _h: u16, _v: &[u8]) -> Result<(), danfoss_eco::TransportError> { Ok(()) }
//! # }
//! # fn transport_for_device() -> MyTransport { MyTransport }
//!
//! let config = DeviceConfig::default();
//! let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let mut session = DeviceSession::new(transport_for_device(), &config, events_tx)?;
//!
//! // on the host's polling schedule:
//! session.update();
//!
//! // on a host-requested change:
//! session.control(ControlRequest {
//!     target_temperature: Some(21.0),
//!     mode: None,
//! });
//!
//! // per scheduler tick, after forwarding any pending transport events
//! // via session.handle_event(...):
//! session.tick();
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod domain;
pub mod infrastructure;

pub use domain::models::{
    ClimateAction, ClimateMode, ControlRequest, ErrorFlags, StateEvent, ThermostatState,
};
pub use domain::settings::{ConfigService, DeviceConfig, LogSettings, SecretKeyStore};
pub use infrastructure::bluetooth::property::PropertyKind;
pub use infrastructure::bluetooth::{DeviceError, DeviceSession, SessionState};
pub use infrastructure::bluetooth::transport::{GattStatus, LinkEvent, Transport, TransportError};
pub use infrastructure::crypto::{CryptoError, Xxtea};
pub use infrastructure::logging::{init_logger, LoggingGuard};
