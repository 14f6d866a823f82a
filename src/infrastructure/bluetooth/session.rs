//! Device Session
//!
//! One session models one physical link to one thermostat. The session owns
//! the connection lifecycle, the PIN handshake, the secret-key bootstrap,
//! the outstanding-request accounting and the command queue; the host only
//! calls [`DeviceSession::update`] / [`DeviceSession::control`] on its
//! schedule, pumps [`DeviceSession::tick`], and forwards transport events
//! into [`DeviceSession::handle_event`].
//!
//! Everything runs on one logical thread: submissions never block, and all
//! waiting is event-driven. The device tolerates long idle connections
//! poorly, so the session disconnects as soon as the queue is drained and
//! nothing is outstanding.

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::models::{ClimateAction, ControlRequest, StateEvent, ThermostatState};
use crate::domain::settings::{parse_secret_key, DeviceConfig, SecretKeyStore};
use crate::infrastructure::bluetooth::property::{PropertyKind, PropertyTable};
use crate::infrastructure::bluetooth::protocol::{self, DeviceData, TemperatureData};
use crate::infrastructure::bluetooth::queue::{Command, CommandKind, CommandQueue};
use crate::infrastructure::bluetooth::transport::{GattStatus, LinkEvent, Transport};
use crate::infrastructure::bluetooth::DeviceError;
use crate::infrastructure::crypto::{Xxtea, KEY_LEN};

const READ_BATCH: [PropertyKind; 4] = [
    PropertyKind::Battery,
    PropertyKind::Temperature,
    PropertyKind::Settings,
    PropertyKind::Errors,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No link, nothing in flight.
    Idle,
    /// Connection requested; waiting for service discovery.
    Connecting,
    /// Handles resolved and the PIN write submitted.
    AwaitingPin,
    /// Authenticated; queued commands may be executed.
    Established,
}

/// Session state machine for a single eTRV.
pub struct DeviceSession<T: Transport> {
    transport: T,
    codec: Xxtea,
    properties: PropertyTable,
    queue: CommandQueue,
    state: SessionState,
    /// GATT operations submitted but not yet completed. Completions may
    /// arrive in any order across handles.
    outstanding: u32,
    failed: bool,
    pin_code: u32,
    name: String,
    key_store: SecretKeyStore,
    thermostat: ThermostatState,
    events: mpsc::UnboundedSender<StateEvent>,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(
        transport: T,
        config: &DeviceConfig,
        events: mpsc::UnboundedSender<StateEvent>,
    ) -> anyhow::Result<Self> {
        let key_store = SecretKeyStore::new(&config.name, config.state_dir.as_ref())?;

        let mut codec = Xxtea::new();
        if let Some(hex_key) = &config.secret_key {
            codec.set_key(&parse_secret_key(hex_key)?)?;
            debug!("[{}] secret key configured", config.name);
        } else if let Some(key) = key_store.load() {
            codec.set_key(&key)?;
            info!("[{}] using previously learned secret key", config.name);
        } else {
            info!(
                "[{}] no secret key known; press the device button during the next connection to let the driver learn it",
                config.name
            );
        }

        let pin_code = config.pin_code.trim().parse().unwrap_or(0);
        debug!("[{}] PIN: {:04}", config.name, pin_code);

        Ok(Self {
            transport,
            codec,
            properties: PropertyTable::new(),
            queue: CommandQueue::new(),
            state: SessionState::Idle,
            outstanding: 0,
            failed: false,
            pin_code,
            name: config.name.clone(),
            key_store,
            thermostat: ThermostatState::default(),
            events,
        })
    }

    /// Periodic update cycle: make sure a connection is coming up and queue
    /// the standard read batch.
    pub fn update(&mut self) {
        if self.failed {
            warn!("[{}] session failed; ignoring update", self.name);
            return;
        }
        self.connect();
        self.enqueue_read_batch();
    }

    /// Stage a host-requested change and queue the matching writes. Only
    /// the fields present in the request are written.
    pub fn control(&mut self, request: ControlRequest) {
        if self.failed {
            warn!("[{}] session failed; ignoring control request", self.name);
            return;
        }

        let mut queued = false;

        if let Some(target) = request.target_temperature {
            let prop = self.properties.get_mut(PropertyKind::Temperature);
            let room = match &prop.data {
                Some(DeviceData::Temperature(t)) => t.room_temperature,
                _ => 0.0,
            };
            prop.data = Some(DeviceData::Temperature(TemperatureData {
                target_temperature: target,
                room_temperature: room,
            }));
            self.queue.push(Command::write(PropertyKind::Temperature));
            queued = true;
        }

        if let Some(mode) = request.mode {
            let prop = self.properties.get_mut(PropertyKind::Settings);
            match &mut prop.data {
                Some(DeviceData::Settings(s)) => {
                    s.device_mode = mode;
                    // publish immediately so the host UI does not lag
                    // behind the pending write
                    self.thermostat.mode = Some(mode);
                    let _ = self.events.send(StateEvent::Mode(mode));
                    self.queue.push(Command::write(PropertyKind::Settings));
                    queued = true;
                }
                _ => warn!(
                    "[{}] settings not read yet; ignoring mode change",
                    self.name
                ),
            }
        }

        if queued {
            self.connect();
        }
    }

    /// Queue a one-off read, e.g. of the device name or clock.
    pub fn request_read(&mut self, kind: PropertyKind) {
        if self.failed {
            return;
        }
        if kind == PropertyKind::Pin {
            warn!("[{}] pin characteristic is write-only", self.name);
            return;
        }
        self.queue.push(Command::read(kind));
        self.connect();
    }

    /// Scheduler tick: while established, drain the queue and submit every
    /// command, then disconnect if the device owes us nothing.
    pub fn tick(&mut self) {
        if self.state != SessionState::Established {
            return;
        }

        while let Some(command) = self.queue.pop() {
            if self.execute(command) {
                self.outstanding += 1;
            }
        }

        // nothing queued and nothing in flight - done with the device for
        // now
        if self.outstanding == 0 && self.queue.is_empty() {
            debug!("[{}] no pending requests; disconnecting", self.name);
            self.drop_link();
        }
    }

    /// Feed a transport event into the state machine.
    pub fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                debug!("[{}] link up, waiting for service discovery", self.name);
            }
            LinkEvent::ServicesResolved => self.on_services_resolved(),
            LinkEvent::Disconnected { reason } => {
                info!("[{}] disconnected, reason={reason:#04x}", self.name);
                // no completions for the old connection are guaranteed to
                // arrive
                self.reset_link_state();
            }
            LinkEvent::ReadComplete {
                handle,
                status,
                value,
            } => self.on_read_complete(handle, status, &value),
            LinkEvent::WriteComplete { handle, status } => self.on_write_complete(handle, status),
        }
    }

    /// Last published thermostat state.
    pub fn thermostat(&self) -> &ThermostatState {
        &self.thermostat
    }

    pub fn session_state(&self) -> SessionState {
        self.state
    }

    /// A fatal error (bad PIN, wrong device model) latched the session off.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Clear the failure latch after external reconfiguration.
    pub fn reset_failure(&mut self) {
        self.failed = false;
    }

    fn connect(&mut self) {
        if self.state != SessionState::Idle {
            return;
        }
        if !self.transport.is_enabled() {
            debug!("[{}] re-enabling transport node", self.name);
            self.transport.set_enabled(true);
        }
        // scanning interferes with connection attempts on the target stack
        self.transport.stop_scan();
        self.transport.request_connection();
        self.state = SessionState::Connecting;
    }

    fn enqueue_read_batch(&mut self) {
        for kind in READ_BATCH {
            self.queue.push(Command::read(kind));
        }
    }

    fn on_services_resolved(&mut self) {
        if self.state != SessionState::Connecting {
            debug!(
                "[{}] discovery event ignored in state {:?}",
                self.name, self.state
            );
            return;
        }

        for kind in PropertyKind::ALL {
            if kind == PropertyKind::SecretKey {
                if self.codec.is_keyed() {
                    debug!("[{}] key already known, skipping secret_key lookup", self.name);
                    continue;
                }
                match self.find_handle(kind) {
                    Some(handle) => self.properties.get_mut(kind).handle = Some(handle),
                    None => warn!(
                        "[{}] hardware button was not pressed, unable to read the secret key",
                        self.name
                    ),
                }
                continue;
            }

            match self.find_handle(kind) {
                Some(handle) => self.properties.get_mut(kind).handle = Some(handle),
                None if kind.mandatory() => {
                    let err = DeviceError::CharacteristicMissing {
                        characteristic: kind.characteristic_uuid(),
                    };
                    error!("[{}] {err}; not a Danfoss Eco eTRV?", self.name);
                    self.fail_session();
                    return;
                }
                None => warn!(
                    "[{}] characteristic {} not found; {} unavailable this session",
                    self.name,
                    kind.characteristic_uuid(),
                    kind.name()
                ),
            }
        }

        self.write_pin();
    }

    fn find_handle(&self, kind: PropertyKind) -> Option<u16> {
        self.transport
            .find_characteristic(&kind.service_uuid(), &kind.characteristic_uuid())
    }

    fn write_pin(&mut self) {
        let Some(handle) = self.properties.get(PropertyKind::Pin).handle else {
            // resolution above guarantees the handle; keep the failure
            // latch consistent anyway
            self.fail_session();
            return;
        };

        debug!("[{}] writing pin", self.name);
        let payload = protocol::pack_pin(self.pin_code);
        match self.transport.write_characteristic(handle, &payload) {
            Ok(()) => self.state = SessionState::AwaitingPin,
            Err(e) => {
                warn!("[{}] pin submission failed: {e}; dropping link", self.name);
                self.drop_link();
            }
        }
    }

    fn on_pin_result(&mut self, status: GattStatus) {
        if self.state != SessionState::AwaitingPin {
            debug!(
                "[{}] pin completion ignored in state {:?}",
                self.name, self.state
            );
            return;
        }

        match status {
            GattStatus::Success => {
                debug!("[{}] pin OK", self.name);
                self.state = SessionState::Established;
                if !self.codec.is_keyed()
                    && self.properties.get(PropertyKind::SecretKey).handle.is_some()
                {
                    self.queue.push(Command::read(PropertyKind::SecretKey));
                }
            }
            GattStatus::Error(code) => {
                error!("[{}] {}", self.name, DeviceError::AuthRejected(code));
                self.fail_session();
            }
        }
    }

    fn on_write_complete(&mut self, handle: u16, status: GattStatus) {
        if self.properties.get(PropertyKind::Pin).handle == Some(handle) {
            self.on_pin_result(status);
            return;
        }

        self.outstanding = self.outstanding.saturating_sub(1);
        if let GattStatus::Error(code) = status {
            warn!(
                "[{}] failed to write characteristic: handle={handle:#04x}, status={code:#04x}",
                self.name
            );
            return;
        }

        // write ACK: re-read the device so published state reflects its own
        // view of the change
        self.enqueue_read_batch();
    }

    fn on_read_complete(&mut self, handle: u16, status: GattStatus, value: &[u8]) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if let GattStatus::Error(code) = status {
            warn!(
                "[{}] failed to read characteristic: handle={handle:#04x}, status={code:#04x}",
                self.name
            );
            return;
        }

        let Some(kind) = self.properties.by_handle(handle).map(|p| p.kind) else {
            warn!("[{}] unknown property with handle={handle:#04x}", self.name);
            return;
        };

        match self.decode_payload(kind, value) {
            Ok(data) => self.apply_data(kind, data),
            Err(e) => warn!(
                "[{}] {} decode failed, keeping previous value: {e}",
                self.name,
                kind.name()
            ),
        }
    }

    fn decode_payload(&self, kind: PropertyKind, raw: &[u8]) -> Result<DeviceData, DeviceError> {
        if kind.encrypted() {
            let plain = self.codec.decrypt(raw)?;
            protocol::decode(kind, &plain)
        } else {
            protocol::decode(kind, raw)
        }
    }

    fn apply_data(&mut self, kind: PropertyKind, data: DeviceData) {
        match &data {
            DeviceData::Battery { level } => {
                debug!("[{}] battery level: {level} %", self.name);
                self.thermostat.battery_level = Some(*level);
                let _ = self.events.send(StateEvent::Battery(*level));
            }
            DeviceData::Temperature(t) => {
                debug!(
                    "[{}] room temperature: {:.1} C, set point: {:.1} C",
                    self.name, t.room_temperature, t.target_temperature
                );
                self.thermostat.room_temperature = Some(t.room_temperature);
                self.thermostat.target_temperature = Some(t.target_temperature);
                self.thermostat.action = Some(if t.room_temperature > t.target_temperature {
                    ClimateAction::Idle
                } else {
                    ClimateAction::Heating
                });
                let _ = self.events.send(StateEvent::Temperature {
                    room: t.room_temperature,
                    target: t.target_temperature,
                });
            }
            DeviceData::Settings(s) => {
                debug!(
                    "[{}] mode: {:?}, min: {:.1} C, max: {:.1} C, frost: {:.1} C",
                    self.name,
                    s.device_mode,
                    s.temperature_min,
                    s.temperature_max,
                    s.frost_protection_temperature
                );
                debug!(
                    "[{}] adaptable_regulation: {}, display_flip: {}, lock_control: {}",
                    self.name,
                    s.adaptable_regulation(),
                    s.display_flip(),
                    s.lock_control()
                );
                self.thermostat.mode = Some(s.device_mode);
                self.thermostat.temperature_min = Some(s.temperature_min);
                self.thermostat.temperature_max = Some(s.temperature_max);
                let _ = self.events.send(StateEvent::Mode(s.device_mode));
            }
            DeviceData::Errors(e) => {
                debug!(
                    "[{}] errors: valve_stuck={}, invalid_time={}, low_battery={}, very_low_battery={}",
                    self.name, e.valve_stuck, e.invalid_time, e.low_battery, e.very_low_battery
                );
                self.thermostat.problems = Some(*e);
                let _ = self.events.send(StateEvent::Problems(*e));
            }
            DeviceData::Name(n) => {
                debug!("[{}] device reports name {n:?}", self.name);
                self.thermostat.device_name = Some(n.clone());
            }
            DeviceData::CurrentTime(t) => {
                debug!(
                    "[{}] device clock: epoch={}, utc_offset={}s",
                    self.name, t.local_epoch_seconds, t.utc_offset_seconds
                );
            }
            DeviceData::SecretKey(key) => self.learn_secret_key(*key),
        }

        self.properties.get_mut(kind).data = Some(data);
    }

    fn learn_secret_key(&mut self, key: [u8; KEY_LEN]) {
        info!(
            "[{}] secret key read from device; consider adding it to your configuration:",
            self.name
        );
        info!("[{}] secret_key: {}", self.name, hex::encode(key));

        if let Err(e) = self.codec.set_key(&key) {
            warn!("[{}] failed to apply learned key: {e}", self.name);
            return;
        }
        if let Err(e) = self.key_store.save(&key) {
            warn!("[{}] failed to persist learned key: {e}", self.name);
        }
        let _ = self.events.send(StateEvent::SecretKeyLearned);
    }

    /// Submit one queued command. Returns whether a completion is now owed.
    fn execute(&mut self, command: Command) -> bool {
        let prop = self.properties.get(command.target);
        let Some(handle) = prop.handle else {
            warn!(
                "[{}] no handle for {} this connection; dropping command",
                self.name,
                command.target.name()
            );
            return false;
        };

        match command.kind {
            CommandKind::Read => match self.transport.read_characteristic(handle) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        "[{}] read submission failed for {}: {e}",
                        self.name,
                        command.target.name()
                    );
                    false
                }
            },
            CommandKind::Write => {
                let payload = match self.pack_payload(command.target) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(
                            "[{}] cannot pack {} write: {e}",
                            self.name,
                            command.target.name()
                        );
                        return false;
                    }
                };
                debug!(
                    "[{}] write_request: handle={handle:#04x}, data={payload:02x?}",
                    self.name
                );
                match self.transport.write_characteristic(handle, &payload) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            "[{}] write submission failed for {}: {e}",
                            self.name,
                            command.target.name()
                        );
                        false
                    }
                }
            }
        }
    }

    fn pack_payload(&self, kind: PropertyKind) -> Result<Vec<u8>, DeviceError> {
        match (kind, &self.properties.get(kind).data) {
            (PropertyKind::Temperature, Some(DeviceData::Temperature(t))) => {
                Ok(self.codec.encrypt(&t.pack())?)
            }
            (PropertyKind::Settings, Some(DeviceData::Settings(s))) => {
                Ok(self.codec.encrypt(&s.pack())?)
            }
            _ => Err(DeviceError::NoStagedValue {
                property: kind.name(),
            }),
        }
    }

    fn fail_session(&mut self) {
        self.failed = true;
        let _ = self.events.send(StateEvent::Failed);
        self.drop_link();
    }

    /// Self-initiated teardown; disabling the node drops the link.
    fn drop_link(&mut self) {
        self.transport.set_enabled(false);
        self.reset_link_state();
    }

    fn reset_link_state(&mut self) {
        self.outstanding = 0;
        self.properties.invalidate_handles();
        self.state = SessionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ClimateMode;
    use crate::infrastructure::bluetooth::transport::TransportError;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use uuid::Uuid;

    const HANDLE_PIN: u16 = 0x24;
    const HANDLE_SETTINGS: u16 = 0x2A;
    const HANDLE_TEMPERATURE: u16 = 0x2D;
    const HANDLE_NAME: u16 = 0x30;
    const HANDLE_CURRENT_TIME: u16 = 0x36;
    const HANDLE_ERRORS: u16 = 0x38;
    const HANDLE_SECRET_KEY: u16 = 0x3B;
    const HANDLE_BATTERY: u16 = 0x10;

    const TEST_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f";

    #[derive(Default)]
    struct FakeTransport {
        enabled: bool,
        connect_requests: u32,
        scan_stops: u32,
        characteristics: HashMap<Uuid, u16>,
        reads: Vec<u16>,
        writes: Vec<(u16, Vec<u8>)>,
        fail_submissions: bool,
    }

    impl FakeTransport {
        fn with_all_characteristics() -> Self {
            let mut characteristics = HashMap::new();
            characteristics.insert(protocol::CHARACTERISTIC_PIN, HANDLE_PIN);
            characteristics.insert(protocol::CHARACTERISTIC_SETTINGS, HANDLE_SETTINGS);
            characteristics.insert(protocol::CHARACTERISTIC_TEMPERATURE, HANDLE_TEMPERATURE);
            characteristics.insert(protocol::CHARACTERISTIC_NAME, HANDLE_NAME);
            characteristics.insert(protocol::CHARACTERISTIC_CURRENT_TIME, HANDLE_CURRENT_TIME);
            characteristics.insert(protocol::CHARACTERISTIC_ERRORS, HANDLE_ERRORS);
            characteristics.insert(protocol::CHARACTERISTIC_SECRET_KEY, HANDLE_SECRET_KEY);
            characteristics.insert(protocol::CHARACTERISTIC_BATTERY, HANDLE_BATTERY);
            Self {
                characteristics,
                ..Self::default()
            }
        }

        fn without(mut self, characteristic: Uuid) -> Self {
            self.characteristics.remove(&characteristic);
            self
        }
    }

    impl Transport for FakeTransport {
        fn stop_scan(&mut self) {
            self.scan_stops += 1;
        }

        fn set_enabled(&mut self, enabled: bool) {
            self.enabled = enabled;
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn request_connection(&mut self) {
            self.connect_requests += 1;
        }

        fn find_characteristic(&self, _service: &Uuid, characteristic: &Uuid) -> Option<u16> {
            self.characteristics.get(characteristic).copied()
        }

        fn read_characteristic(&mut self, handle: u16) -> Result<(), TransportError> {
            if self.fail_submissions {
                return Err(TransportError::Busy);
            }
            self.reads.push(handle);
            Ok(())
        }

        fn write_characteristic(
            &mut self,
            handle: u16,
            value: &[u8],
        ) -> Result<(), TransportError> {
            if self.fail_submissions {
                return Err(TransportError::Busy);
            }
            self.writes.push((handle, value.to_vec()));
            Ok(())
        }
    }

    fn temp_state_dir(tag: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("danfoss-eco-session-{tag}-{}", std::process::id()));
        dir
    }

    fn make_session(
        tag: &str,
        transport: FakeTransport,
        with_key: bool,
    ) -> (
        DeviceSession<FakeTransport>,
        mpsc::UnboundedReceiver<StateEvent>,
    ) {
        let config = DeviceConfig {
            name: tag.to_string(),
            secret_key: with_key.then(|| TEST_KEY_HEX.to_string()),
            state_dir: Some(temp_state_dir(tag)),
            ..DeviceConfig::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let session = DeviceSession::new(transport, &config, tx).unwrap();
        (session, rx)
    }

    fn test_codec() -> Xxtea {
        Xxtea::with_key(&parse_secret_key(TEST_KEY_HEX).unwrap()).unwrap()
    }

    fn establish(session: &mut DeviceSession<FakeTransport>) {
        session.handle_event(LinkEvent::ServicesResolved);
        session.handle_event(LinkEvent::WriteComplete {
            handle: HANDLE_PIN,
            status: GattStatus::Success,
        });
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<StateEvent>) -> Vec<StateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_happy_path_update_cycle() {
        let (mut session, mut rx) =
            make_session("happy-path", FakeTransport::with_all_characteristics(), true);

        session.update();
        assert_eq!(session.session_state(), SessionState::Connecting);
        assert_eq!(session.transport.connect_requests, 1);
        assert!(session.transport.enabled);
        assert!(session.transport.scan_stops > 0);

        session.handle_event(LinkEvent::ServicesResolved);
        assert_eq!(session.session_state(), SessionState::AwaitingPin);
        // exactly one pin write, plaintext "0000" as a big-endian u32
        assert_eq!(session.transport.writes, vec![(HANDLE_PIN, vec![0, 0, 0, 0])]);

        session.handle_event(LinkEvent::WriteComplete {
            handle: HANDLE_PIN,
            status: GattStatus::Success,
        });
        assert_eq!(session.session_state(), SessionState::Established);

        session.tick();
        assert_eq!(
            session.transport.reads,
            vec![
                HANDLE_BATTERY,
                HANDLE_TEMPERATURE,
                HANDLE_SETTINGS,
                HANDLE_ERRORS
            ]
        );
        assert_eq!(session.outstanding, 4);

        // link stays up while completions are owed
        session.tick();
        assert_eq!(session.session_state(), SessionState::Established);

        let codec = test_codec();
        session.handle_event(LinkEvent::ReadComplete {
            handle: HANDLE_BATTERY,
            status: GattStatus::Success,
            value: vec![80],
        });
        session.handle_event(LinkEvent::ReadComplete {
            handle: HANDLE_TEMPERATURE,
            status: GattStatus::Success,
            value: codec.encrypt(&[0x28, 0x2C, 0, 0, 0, 0, 0, 0]).unwrap(),
        });
        let mut settings_plain = [0u8; 16];
        settings_plain[1] = 10;
        settings_plain[2] = 56;
        settings_plain[4] = protocol::device_mode::SCHEDULED;
        session.handle_event(LinkEvent::ReadComplete {
            handle: HANDLE_SETTINGS,
            status: GattStatus::Success,
            value: codec.encrypt(&settings_plain).unwrap(),
        });
        let mut errors_plain = [0u8; 16];
        errors_plain[0] = 0x01; // E9
        session.handle_event(LinkEvent::ReadComplete {
            handle: HANDLE_ERRORS,
            status: GattStatus::Success,
            value: codec.encrypt(&errors_plain).unwrap(),
        });
        assert_eq!(session.outstanding, 0);

        let state = session.thermostat();
        assert_eq!(state.battery_level, Some(80));
        assert_eq!(state.room_temperature, Some(22.0));
        assert_eq!(state.target_temperature, Some(20.0));
        assert_eq!(state.action, Some(ClimateAction::Idle));
        assert_eq!(state.mode, Some(ClimateMode::Auto));
        assert_eq!(state.temperature_min, Some(5.0));
        assert!(state.problems.unwrap().valve_stuck);

        let events = drain_events(&mut rx);
        assert!(events.contains(&StateEvent::Battery(80)));
        assert!(events.contains(&StateEvent::Mode(ClimateMode::Auto)));

        // everything drained: the idle tick tears the link down
        session.tick();
        assert_eq!(session.session_state(), SessionState::Idle);
        assert!(!session.transport.enabled);
        assert!(session.properties.get(PropertyKind::Battery).handle.is_none());
    }

    #[test]
    fn test_idle_established_session_disconnects_on_tick() {
        let (mut session, _rx) =
            make_session("idle-tick", FakeTransport::with_all_characteristics(), true);

        session.connect();
        establish(&mut session);
        assert_eq!(session.session_state(), SessionState::Established);
        assert!(session.queue.is_empty());

        session.tick();
        assert_eq!(session.session_state(), SessionState::Idle);
        assert!(!session.transport.enabled);
    }

    #[test]
    fn test_connect_request_is_idempotent() {
        let (mut session, _rx) = make_session(
            "idempotent-connect",
            FakeTransport::with_all_characteristics(),
            true,
        );

        session.update();
        session.update();
        assert_eq!(session.transport.connect_requests, 1);
        // both batches stay queued for the one connection
        assert_eq!(session.queue.len(), 8);
    }

    #[test]
    fn test_fatal_pin_failure() {
        let (mut session, mut rx) =
            make_session("fatal-pin", FakeTransport::with_all_characteristics(), true);

        session.update();
        session.handle_event(LinkEvent::ServicesResolved);
        session.handle_event(LinkEvent::WriteComplete {
            handle: HANDLE_PIN,
            status: GattStatus::Error(0x85),
        });

        assert!(session.is_failed());
        assert_eq!(session.session_state(), SessionState::Idle);
        assert!(!session.transport.enabled);
        assert!(drain_events(&mut rx).contains(&StateEvent::Failed));

        // no reconnect until externally reset
        let requests = session.transport.connect_requests;
        session.update();
        assert_eq!(session.transport.connect_requests, requests);

        session.reset_failure();
        session.update();
        assert_eq!(session.transport.connect_requests, requests + 1);
    }

    #[test]
    fn test_missing_mandatory_characteristic_is_fatal() {
        let transport = FakeTransport::with_all_characteristics()
            .without(protocol::CHARACTERISTIC_SETTINGS);
        let (mut session, mut rx) = make_session("missing-settings", transport, true);

        session.update();
        session.handle_event(LinkEvent::ServicesResolved);

        assert!(session.is_failed());
        assert_eq!(session.session_state(), SessionState::Idle);
        assert!(drain_events(&mut rx).contains(&StateEvent::Failed));
        // no pin write went out
        assert!(session.transport.writes.is_empty());
    }

    #[test]
    fn test_missing_optional_characteristic_is_not_fatal() {
        let transport =
            FakeTransport::with_all_characteristics().without(protocol::CHARACTERISTIC_SECRET_KEY);
        let (mut session, _rx) = make_session("missing-secret", transport, false);

        session.update();
        session.handle_event(LinkEvent::ServicesResolved);

        assert!(!session.is_failed());
        assert_eq!(session.session_state(), SessionState::AwaitingPin);
    }

    #[test]
    fn test_secret_key_bootstrap() {
        let _ = std::fs::remove_dir_all(temp_state_dir("learn-key"));
        let (mut session, mut rx) = make_session(
            "learn-key",
            FakeTransport::with_all_characteristics(),
            false,
        );
        assert!(!session.codec.is_keyed());

        session.connect();
        establish(&mut session);

        // entering Established queued the secret-key read
        session.tick();
        assert_eq!(session.transport.reads, vec![HANDLE_SECRET_KEY]);
        assert_eq!(session.outstanding, 1);

        let key = parse_secret_key(TEST_KEY_HEX).unwrap();
        session.handle_event(LinkEvent::ReadComplete {
            handle: HANDLE_SECRET_KEY,
            status: GattStatus::Success,
            value: key.to_vec(),
        });

        assert!(session.codec.is_keyed());
        assert!(drain_events(&mut rx).contains(&StateEvent::SecretKeyLearned));

        // the learned key was persisted in the device's slot
        let store =
            SecretKeyStore::new("learn-key", Some(&temp_state_dir("learn-key"))).unwrap();
        assert_eq!(store.load(), Some(key));

        std::fs::remove_dir_all(temp_state_dir("learn-key")).unwrap();
    }

    #[test]
    fn test_keyed_session_skips_secret_key() {
        let (mut session, _rx) = make_session(
            "skip-secret",
            FakeTransport::with_all_characteristics(),
            true,
        );

        session.connect();
        establish(&mut session);
        assert!(session
            .properties
            .get(PropertyKind::SecretKey)
            .handle
            .is_none());
        assert!(session.queue.is_empty());
    }

    #[test]
    fn test_disconnect_cancels_in_flight_requests() {
        let (mut session, _rx) = make_session(
            "disconnect-reset",
            FakeTransport::with_all_characteristics(),
            true,
        );

        session.update();
        establish(&mut session);
        session.tick();
        assert_eq!(session.outstanding, 4);

        session.handle_event(LinkEvent::Disconnected { reason: 0x13 });
        assert_eq!(session.outstanding, 0);
        assert_eq!(session.session_state(), SessionState::Idle);
        assert!(session
            .properties
            .iter()
            .all(|p| p.handle.is_none()));
    }

    #[test]
    fn test_failed_submission_is_not_counted() {
        let (mut session, _rx) = make_session(
            "failed-submission",
            FakeTransport::with_all_characteristics(),
            true,
        );

        session.update();
        establish(&mut session);
        session.transport.fail_submissions = true;

        session.tick();
        // nothing was submitted, so nothing is outstanding and the idle
        // disconnect fires on the same tick
        assert_eq!(session.outstanding, 0);
        assert_eq!(session.session_state(), SessionState::Idle);
    }

    #[test]
    fn test_failed_decode_keeps_previous_value() {
        let (mut session, _rx) = make_session(
            "stale-value",
            FakeTransport::with_all_characteristics(),
            true,
        );

        session.update();
        establish(&mut session);
        session.tick();

        session.handle_event(LinkEvent::ReadComplete {
            handle: HANDLE_BATTERY,
            status: GattStatus::Success,
            value: vec![75],
        });
        assert_eq!(session.thermostat().battery_level, Some(75));

        // malformed length: value is discarded, state is retained
        session.handle_event(LinkEvent::ReadComplete {
            handle: HANDLE_BATTERY,
            status: GattStatus::Success,
            value: vec![1, 2, 3],
        });
        assert_eq!(session.thermostat().battery_level, Some(75));

        // garbage ciphertext of the wrong width: same stale semantics
        session.handle_event(LinkEvent::ReadComplete {
            handle: HANDLE_TEMPERATURE,
            status: GattStatus::Success,
            value: vec![0xFF; 5],
        });
        assert_eq!(session.thermostat().room_temperature, None);
    }

    #[test]
    fn test_control_writes_temperature() {
        let (mut session, _rx) = make_session(
            "control-temp",
            FakeTransport::with_all_characteristics(),
            true,
        );

        session.connect();
        establish(&mut session);

        session.control(ControlRequest {
            target_temperature: Some(21.0),
            mode: None,
        });
        session.tick();

        let (handle, payload) = session.transport.writes.last().unwrap().clone();
        assert_eq!(handle, HANDLE_TEMPERATURE);
        let plain = test_codec().decrypt(&payload).unwrap();
        assert_eq!(plain[0], 42); // 21.0 C in half-degree units
    }

    #[test]
    fn test_control_mode_requires_settings_and_publishes_early() {
        let (mut session, mut rx) = make_session(
            "control-mode",
            FakeTransport::with_all_characteristics(),
            true,
        );

        session.connect();
        establish(&mut session);

        // mode change before settings were ever read is ignored
        session.control(ControlRequest {
            target_temperature: None,
            mode: Some(ClimateMode::Heat),
        });
        assert!(session.queue.is_empty());

        let codec = test_codec();
        let mut settings_plain = [0u8; 16];
        settings_plain[4] = protocol::device_mode::SCHEDULED;
        settings_plain[15] = 0xEE;
        session.queue.push(Command::read(PropertyKind::Settings));
        session.tick();
        session.handle_event(LinkEvent::ReadComplete {
            handle: HANDLE_SETTINGS,
            status: GattStatus::Success,
            value: codec.encrypt(&settings_plain).unwrap(),
        });
        drain_events(&mut rx);

        session.control(ControlRequest {
            target_temperature: None,
            mode: Some(ClimateMode::Heat),
        });
        // published optimistically before the write completes
        assert_eq!(session.thermostat().mode, Some(ClimateMode::Heat));
        assert!(drain_events(&mut rx).contains(&StateEvent::Mode(ClimateMode::Heat)));

        session.tick();
        let (handle, payload) = session.transport.writes.last().unwrap().clone();
        assert_eq!(handle, HANDLE_SETTINGS);
        let plain = codec.decrypt(&payload).unwrap();
        assert_eq!(plain[4], protocol::device_mode::MANUAL);
        assert_eq!(plain[15], 0xEE); // reserved bytes survive the write-back
    }

    #[test]
    fn test_request_read_of_device_name() {
        let (mut session, _rx) = make_session(
            "read-name",
            FakeTransport::with_all_characteristics(),
            true,
        );

        session.request_read(PropertyKind::Name);
        assert_eq!(session.session_state(), SessionState::Connecting);
        establish(&mut session);

        session.tick();
        assert_eq!(session.transport.reads, vec![HANDLE_NAME]);

        let mut plain = [0u8; 16];
        plain[..7].copy_from_slice(b"Hallway");
        session.handle_event(LinkEvent::ReadComplete {
            handle: HANDLE_NAME,
            status: GattStatus::Success,
            value: test_codec().encrypt(&plain).unwrap(),
        });
        assert_eq!(session.thermostat().device_name.as_deref(), Some("Hallway"));
    }

    #[test]
    fn test_write_ack_triggers_read_back() {
        let (mut session, _rx) = make_session(
            "read-back",
            FakeTransport::with_all_characteristics(),
            true,
        );

        session.connect();
        establish(&mut session);

        session.control(ControlRequest {
            target_temperature: Some(19.5),
            mode: None,
        });
        session.tick();
        assert_eq!(session.outstanding, 1);

        session.handle_event(LinkEvent::WriteComplete {
            handle: HANDLE_TEMPERATURE,
            status: GattStatus::Success,
        });
        assert_eq!(session.outstanding, 0);
        assert_eq!(session.queue.len(), READ_BATCH.len());
    }
}
