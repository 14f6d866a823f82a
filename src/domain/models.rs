use serde::Serialize;

/// Logical operating mode exposed to the host.
///
/// The device distinguishes four raw schedule modes; the driver collapses
/// them to manual heating vs. schedule-driven operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClimateMode {
    /// Manual set-point control (raw MANUAL and HOLD).
    Heat,
    /// Device-side schedule or vacation program (raw SCHEDULED and VACATION).
    Auto,
}

/// What the valve is currently doing, derived from the temperature reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClimateAction {
    Idle,
    Heating,
}

/// Device-reported error flags (E-codes from the display).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorFlags {
    /// E9: the valve does not close.
    pub valve_stuck: bool,
    /// E10: device clock is invalid.
    pub invalid_time: bool,
    /// E14: low battery.
    pub low_battery: bool,
    /// E15: very low battery.
    pub very_low_battery: bool,
}

impl ErrorFlags {
    pub fn any(&self) -> bool {
        self.valve_stuck || self.invalid_time || self.low_battery || self.very_low_battery
    }
}

/// A host-side change request; only the populated fields are written.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControlRequest {
    pub target_temperature: Option<f32>,
    pub mode: Option<ClimateMode>,
}

/// Last known thermostat state, updated as reads complete.
///
/// Fields stay `None` until the first successful read, and keep their last
/// good value when a later read fails to decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThermostatState {
    pub battery_level: Option<u8>,
    pub room_temperature: Option<f32>,
    pub target_temperature: Option<f32>,
    pub mode: Option<ClimateMode>,
    pub action: Option<ClimateAction>,
    pub temperature_min: Option<f32>,
    pub temperature_max: Option<f32>,
    pub problems: Option<ErrorFlags>,
    pub device_name: Option<String>,
}

/// Events pushed to the host as device state is decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    Battery(u8),
    Temperature { room: f32, target: f32 },
    Mode(ClimateMode),
    Problems(ErrorFlags),
    /// The secret key was read off the device and persisted.
    SecretKeyLearned,
    /// The session hit a fatal error and will not reconnect on its own.
    Failed,
}
