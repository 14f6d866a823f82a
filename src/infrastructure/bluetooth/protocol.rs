//! eTRV Protocol
//!
//! This module contains the protocol definitions for communicating with
//! the Danfoss Eco eTRV: the fixed GATT identifiers, the wire layout of
//! every characteristic payload, and the decode/encode routines that turn
//! decrypted bytes into typed data.

use crate::domain::models::{ClimateMode, ErrorFlags};
use crate::infrastructure::bluetooth::property::PropertyKind;
use crate::infrastructure::bluetooth::DeviceError;
use crate::infrastructure::crypto::KEY_LEN;
use tracing::warn;
use uuid::Uuid;

/// Proprietary settings service hosting everything but the battery level.
pub const SERVICE_SETTINGS: Uuid = Uuid::from_u128(0x10020000_2749_0001_0000_00805f9b042f);

pub const CHARACTERISTIC_PIN: Uuid = Uuid::from_u128(0x10020001_2749_0001_0000_00805f9b042f);
pub const CHARACTERISTIC_SETTINGS: Uuid = Uuid::from_u128(0x10020003_2749_0001_0000_00805f9b042f);
pub const CHARACTERISTIC_TEMPERATURE: Uuid =
    Uuid::from_u128(0x10020005_2749_0001_0000_00805f9b042f);
pub const CHARACTERISTIC_NAME: Uuid = Uuid::from_u128(0x10020006_2749_0001_0000_00805f9b042f);
pub const CHARACTERISTIC_CURRENT_TIME: Uuid =
    Uuid::from_u128(0x10020008_2749_0001_0000_00805f9b042f);
pub const CHARACTERISTIC_ERRORS: Uuid = Uuid::from_u128(0x10020009_2749_0001_0000_00805f9b042f);
/// Only exposed while the hardware button is pressed.
pub const CHARACTERISTIC_SECRET_KEY: Uuid =
    Uuid::from_u128(0x1002000b_2749_0001_0000_00805f9b042f);

/// Standard battery service (16-bit 0x180F under the Bluetooth base UUID).
pub const SERVICE_BATTERY: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
/// Standard battery level characteristic (16-bit 0x2A19).
pub const CHARACTERISTIC_BATTERY: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

pub const PIN_LEN: usize = 4;
pub const TEMPERATURE_LEN: usize = 8;
pub const SETTINGS_LEN: usize = 16;
pub const NAME_LEN: usize = 16;
pub const CURRENT_TIME_LEN: usize = 8;

/// Raw schedule modes as the device stores them in settings byte 4.
pub mod device_mode {
    pub const MANUAL: u8 = 0;
    pub const SCHEDULED: u8 = 1;
    pub const VACATION: u8 = 3;
    pub const HOLD: u8 = 5;
}

/// Collapse a raw schedule mode to the logical mode. Unknown values are a
/// decode anomaly; they log and fall back to Heat instead of failing the
/// whole payload.
pub fn mode_from_raw(raw: u8) -> ClimateMode {
    match raw {
        device_mode::MANUAL | device_mode::HOLD => ClimateMode::Heat,
        device_mode::SCHEDULED | device_mode::VACATION => ClimateMode::Auto,
        other => {
            warn!("unexpected schedule_mode: {other}");
            ClimateMode::Heat
        }
    }
}

pub fn mode_to_raw(mode: ClimateMode) -> u8 {
    match mode {
        ClimateMode::Auto => device_mode::SCHEDULED,
        ClimateMode::Heat => device_mode::MANUAL,
    }
}

/// Decoded value of one characteristic, tagged by property.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceData {
    Battery { level: u8 },
    Temperature(TemperatureData),
    Settings(SettingsData),
    Errors(ErrorFlags),
    Name(String),
    CurrentTime(CurrentTimeData),
    SecretKey([u8; KEY_LEN]),
}

/// # Temperature payload (8 bytes, decrypted)
///
/// ```text
/// [0] : target temperature, half-degree units
/// [1] : room temperature, half-degree units
/// [2-7]: zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureData {
    pub target_temperature: f32,
    pub room_temperature: f32,
}

impl TemperatureData {
    pub fn parse(plain: &[u8]) -> Result<Self, DeviceError> {
        check_len("temperature", TEMPERATURE_LEN, plain)?;
        Ok(Self {
            target_temperature: plain[0] as f32 / 2.0,
            room_temperature: plain[1] as f32 / 2.0,
        })
    }

    pub fn pack(&self) -> [u8; TEMPERATURE_LEN] {
        let mut buff = [0u8; TEMPERATURE_LEN];
        buff[0] = (self.target_temperature * 2.0) as u8;
        buff[1] = (self.room_temperature * 2.0) as u8;
        buff
    }
}

/// # Settings payload (16 bytes, decrypted)
///
/// ```text
/// [0]     : config bitfield
///           bit 0: adaptable regulation
///           bit 2: vertical installation
///           bit 3: display flip
///           bit 4: slow regulation
///           bit 6: valve installed
///           bit 7: lock control
/// [1]     : minimum temperature, half-degree units
/// [2]     : maximum temperature, half-degree units
/// [3]     : frost protection temperature, half-degree units
/// [4]     : raw schedule mode
/// [5]     : vacation temperature, half-degree units
/// [6-9]   : vacation start (u32 big-endian, UTC seconds)
/// [10-13] : vacation end (u32 big-endian, UTC seconds)
/// [14-15] : reserved
/// ```
///
/// The raw bytes are kept alongside the decoded fields so a write-back
/// preserves the bitfield and reserved bytes exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsData {
    raw: [u8; SETTINGS_LEN],
    pub device_mode: ClimateMode,
    pub temperature_min: f32,
    pub temperature_max: f32,
    pub frost_protection_temperature: f32,
    pub vacation_temperature: f32,
    // vacation can be entered directly via the schedule mode, or planned
    // with this window
    pub vacation_from: u32,
    pub vacation_to: u32,
}

impl SettingsData {
    pub fn parse(plain: &[u8]) -> Result<Self, DeviceError> {
        check_len("settings", SETTINGS_LEN, plain)?;
        let mut raw = [0u8; SETTINGS_LEN];
        raw.copy_from_slice(plain);
        Ok(Self {
            raw,
            device_mode: mode_from_raw(plain[4]),
            temperature_min: plain[1] as f32 / 2.0,
            temperature_max: plain[2] as f32 / 2.0,
            frost_protection_temperature: plain[3] as f32 / 2.0,
            vacation_temperature: plain[5] as f32 / 2.0,
            vacation_from: u32::from_be_bytes([plain[6], plain[7], plain[8], plain[9]]),
            vacation_to: u32::from_be_bytes([plain[10], plain[11], plain[12], plain[13]]),
        })
    }

    pub fn pack(&self) -> [u8; SETTINGS_LEN] {
        let mut buff = self.raw;
        buff[1] = (self.temperature_min * 2.0) as u8;
        buff[2] = (self.temperature_max * 2.0) as u8;
        buff[3] = (self.frost_protection_temperature * 2.0) as u8;
        buff[4] = mode_to_raw(self.device_mode);
        buff[5] = (self.vacation_temperature * 2.0) as u8;
        buff[6..10].copy_from_slice(&self.vacation_from.to_be_bytes());
        buff[10..14].copy_from_slice(&self.vacation_to.to_be_bytes());
        buff
    }

    pub fn adaptable_regulation(&self) -> bool {
        self.raw[0] & (1 << 0) != 0
    }
    pub fn vertical_installation(&self) -> bool {
        self.raw[0] & (1 << 2) != 0
    }
    pub fn display_flip(&self) -> bool {
        self.raw[0] & (1 << 3) != 0
    }
    pub fn slow_regulation(&self) -> bool {
        self.raw[0] & (1 << 4) != 0
    }
    pub fn valve_installed(&self) -> bool {
        self.raw[0] & (1 << 6) != 0
    }
    pub fn lock_control(&self) -> bool {
        self.raw[0] & (1 << 7) != 0
    }

    pub fn set_adaptable_regulation(&mut self, on: bool) {
        self.set_config_bit(0, on)
    }
    pub fn set_display_flip(&mut self, on: bool) {
        self.set_config_bit(3, on)
    }
    pub fn set_lock_control(&mut self, on: bool) {
        self.set_config_bit(7, on)
    }

    fn set_config_bit(&mut self, pos: u8, on: bool) {
        if on {
            self.raw[0] |= 1 << pos;
        } else {
            self.raw[0] &= !(1 << pos);
        }
    }
}

/// # Current-time payload (8 bytes, decrypted)
///
/// ```text
/// [0-3] : local time (u32 big-endian, seconds since epoch)
/// [4-7] : UTC offset (i32 big-endian, seconds)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentTimeData {
    pub local_epoch_seconds: u32,
    pub utc_offset_seconds: i32,
}

impl CurrentTimeData {
    pub fn parse(plain: &[u8]) -> Result<Self, DeviceError> {
        check_len("current_time", CURRENT_TIME_LEN, plain)?;
        Ok(Self {
            local_epoch_seconds: u32::from_be_bytes([plain[0], plain[1], plain[2], plain[3]]),
            utc_offset_seconds: i32::from_be_bytes([plain[4], plain[5], plain[6], plain[7]]),
        })
    }
}

/// Errors payload: the leading big-endian u16 is a flag bitfield; the rest
/// of the (padded) payload carries nothing we know how to interpret.
pub fn parse_errors(plain: &[u8]) -> Result<ErrorFlags, DeviceError> {
    if plain.len() < 2 {
        return Err(DeviceError::Decode {
            property: "errors",
            expected: 2,
            actual: plain.len(),
        });
    }
    let bits = u16::from_be_bytes([plain[0], plain[1]]);
    Ok(ErrorFlags {
        valve_stuck: bits & (1 << 8) != 0,      // E9
        invalid_time: bits & (1 << 9) != 0,     // E10
        low_battery: bits & (1 << 13) != 0,     // E14
        very_low_battery: bits & (1 << 14) != 0, // E15
    })
}

/// NUL-padded UTF-8 device name.
pub fn parse_name(plain: &[u8]) -> Result<String, DeviceError> {
    check_len("name", NAME_LEN, plain)?;
    let end = plain.iter().position(|&b| b == 0).unwrap_or(plain.len());
    Ok(String::from_utf8_lossy(&plain[..end]).into_owned())
}

/// The PIN travels as a plaintext big-endian u32.
pub fn pack_pin(pin: u32) -> [u8; PIN_LEN] {
    pin.to_be_bytes()
}

/// Interpret an already-decrypted payload for `kind`.
pub fn decode(kind: PropertyKind, plain: &[u8]) -> Result<DeviceData, DeviceError> {
    match kind {
        PropertyKind::Battery => {
            check_len("battery", 1, plain)?;
            Ok(DeviceData::Battery { level: plain[0] })
        }
        PropertyKind::Temperature => Ok(DeviceData::Temperature(TemperatureData::parse(plain)?)),
        PropertyKind::Settings => Ok(DeviceData::Settings(SettingsData::parse(plain)?)),
        PropertyKind::Errors => Ok(DeviceData::Errors(parse_errors(plain)?)),
        PropertyKind::Name => Ok(DeviceData::Name(parse_name(plain)?)),
        PropertyKind::CurrentTime => Ok(DeviceData::CurrentTime(CurrentTimeData::parse(plain)?)),
        PropertyKind::SecretKey => {
            check_len("secret_key", KEY_LEN, plain)?;
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(plain);
            Ok(DeviceData::SecretKey(key))
        }
        // The PIN characteristic is write-only; nothing to decode.
        PropertyKind::Pin => Err(DeviceError::Decode {
            property: "pin",
            expected: 0,
            actual: plain.len(),
        }),
    }
}

fn check_len(property: &'static str, expected: usize, plain: &[u8]) -> Result<(), DeviceError> {
    if plain.len() != expected {
        return Err(DeviceError::Decode {
            property,
            expected,
            actual: plain.len(),
        });
    }
    Ok(())
}
