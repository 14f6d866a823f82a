//! Property Descriptors
//!
//! Each semantic device attribute is bound to a (service, characteristic)
//! UUID pair and, once service discovery has run, a connection-scoped
//! numeric handle. A property is a tagged variant, not a class hierarchy:
//! the kind decides capability, encryption and payload layout.

use crate::infrastructure::bluetooth::protocol::{self, DeviceData};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Pin,
    Battery,
    Temperature,
    Settings,
    Errors,
    Name,
    CurrentTime,
    SecretKey,
}

impl PropertyKind {
    pub const ALL: [PropertyKind; 8] = [
        PropertyKind::Pin,
        PropertyKind::Battery,
        PropertyKind::Temperature,
        PropertyKind::Settings,
        PropertyKind::Errors,
        PropertyKind::Name,
        PropertyKind::CurrentTime,
        PropertyKind::SecretKey,
    ];

    pub fn service_uuid(self) -> Uuid {
        match self {
            PropertyKind::Battery => protocol::SERVICE_BATTERY,
            _ => protocol::SERVICE_SETTINGS,
        }
    }

    pub fn characteristic_uuid(self) -> Uuid {
        match self {
            PropertyKind::Pin => protocol::CHARACTERISTIC_PIN,
            PropertyKind::Battery => protocol::CHARACTERISTIC_BATTERY,
            PropertyKind::Temperature => protocol::CHARACTERISTIC_TEMPERATURE,
            PropertyKind::Settings => protocol::CHARACTERISTIC_SETTINGS,
            PropertyKind::Errors => protocol::CHARACTERISTIC_ERRORS,
            PropertyKind::Name => protocol::CHARACTERISTIC_NAME,
            PropertyKind::CurrentTime => protocol::CHARACTERISTIC_CURRENT_TIME,
            PropertyKind::SecretKey => protocol::CHARACTERISTIC_SECRET_KEY,
        }
    }

    /// Whether the driver may issue writes against this property.
    pub fn writable(self) -> bool {
        matches!(
            self,
            PropertyKind::Pin | PropertyKind::Temperature | PropertyKind::Settings
        )
    }

    /// Whether payloads are XXTEA-framed. The PIN write, the battery level
    /// and the secret key travel in plaintext.
    pub fn encrypted(self) -> bool {
        !matches!(
            self,
            PropertyKind::Pin | PropertyKind::Battery | PropertyKind::SecretKey
        )
    }

    /// Mandatory characteristics identify the device model; their absence
    /// is fatal. Everything else just becomes unavailable for the session.
    pub fn mandatory(self) -> bool {
        matches!(self, PropertyKind::Pin | PropertyKind::Settings)
    }

    pub fn name(self) -> &'static str {
        match self {
            PropertyKind::Pin => "pin",
            PropertyKind::Battery => "battery",
            PropertyKind::Temperature => "temperature",
            PropertyKind::Settings => "settings",
            PropertyKind::Errors => "errors",
            PropertyKind::Name => "name",
            PropertyKind::CurrentTime => "current_time",
            PropertyKind::SecretKey => "secret_key",
        }
    }
}

/// One property with its connection-scoped handle and last decoded value.
#[derive(Debug, Clone)]
pub struct Property {
    pub kind: PropertyKind,
    /// `None` until discovery resolves it; invalidated on every disconnect.
    pub handle: Option<u16>,
    /// Most recently decoded value; kept unchanged when a decode fails.
    pub data: Option<DeviceData>,
}

impl Property {
    fn new(kind: PropertyKind) -> Self {
        Self {
            kind,
            handle: None,
            data: None,
        }
    }
}

/// Fixed table of all device properties, indexable by kind or handle.
#[derive(Debug, Clone)]
pub struct PropertyTable {
    properties: [Property; PropertyKind::ALL.len()],
}

impl Default for PropertyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyTable {
    pub fn new() -> Self {
        Self {
            properties: PropertyKind::ALL.map(Property::new),
        }
    }

    pub fn get(&self, kind: PropertyKind) -> &Property {
        &self.properties[Self::index(kind)]
    }

    pub fn get_mut(&mut self, kind: PropertyKind) -> &mut Property {
        &mut self.properties[Self::index(kind)]
    }

    /// Property owning a resolved handle, if any.
    pub fn by_handle(&self, handle: u16) -> Option<&Property> {
        self.properties.iter().find(|p| p.handle == Some(handle))
    }

    /// Handles are connection-scoped; drop them all when the link goes away.
    pub fn invalidate_handles(&mut self) {
        for p in &mut self.properties {
            p.handle = None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }

    // matches the order of PropertyKind::ALL
    fn index(kind: PropertyKind) -> usize {
        match kind {
            PropertyKind::Pin => 0,
            PropertyKind::Battery => 1,
            PropertyKind::Temperature => 2,
            PropertyKind::Settings => 3,
            PropertyKind::Errors => 4,
            PropertyKind::Name => 5,
            PropertyKind::CurrentTime => 6,
            PropertyKind::SecretKey => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lookup() {
        let mut table = PropertyTable::new();
        assert!(table.by_handle(0x2A).is_none());

        table.get_mut(PropertyKind::Settings).handle = Some(0x2A);
        assert_eq!(
            table.by_handle(0x2A).map(|p| p.kind),
            Some(PropertyKind::Settings)
        );
    }

    #[test]
    fn test_invalidate_handles_keeps_data() {
        let mut table = PropertyTable::new();
        table.get_mut(PropertyKind::Battery).handle = Some(0x10);
        table.get_mut(PropertyKind::Battery).data = Some(DeviceData::Battery { level: 80 });

        table.invalidate_handles();
        assert!(table.get(PropertyKind::Battery).handle.is_none());
        assert_eq!(
            table.get(PropertyKind::Battery).data,
            Some(DeviceData::Battery { level: 80 })
        );
    }

    #[test]
    fn test_capabilities() {
        assert!(PropertyKind::Temperature.writable());
        assert!(!PropertyKind::Battery.writable());
        assert!(PropertyKind::Settings.encrypted());
        assert!(!PropertyKind::SecretKey.encrypted());
        assert!(PropertyKind::Pin.mandatory());
        assert!(!PropertyKind::SecretKey.mandatory());
    }

    #[test]
    fn test_battery_lives_on_battery_service() {
        assert_eq!(
            PropertyKind::Battery.service_uuid(),
            protocol::SERVICE_BATTERY
        );
        assert_eq!(
            PropertyKind::Temperature.service_uuid(),
            protocol::SERVICE_SETTINGS
        );
    }
}
