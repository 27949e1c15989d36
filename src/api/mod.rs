//! The public data model (§3): addresses, connection state, scan results,
//! and the GATT tree shape shared by [`crate::peripheral::Peripheral`].

pub mod bdaddr;
pub mod bleuuid;

pub use bdaddr::{BDAddr, ParseBDAddrError};
pub use bleuuid::{uuid_from_u16, uuid_from_u32, BleUuid};

use bitflags::bitflags;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

/// Address kind advertised by a peripheral (§3, §6 `AddressType`).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl FromStr for AddressType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(AddressType::Public),
            "random" => Ok(AddressType::Random),
            _ => Err(()),
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Public => write!(f, "public"),
            AddressType::Random => write!(f, "random"),
        }
    }
}

/// Connection lifecycle of one [`crate::peripheral::Peripheral`] (§3, §4.7).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

bitflags! {
    /// Characteristic property bit-set (§3), derived from the daemon's
    /// `Flags` string list (§4.7 GATT tree construction).
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct CharPropFlags: u16 {
        const BROADCAST                     = 0x0001;
        const READ                          = 0x0002;
        const WRITE_WITHOUT_RESPONSE        = 0x0004;
        const WRITE                         = 0x0008;
        const NOTIFY                        = 0x0010;
        const INDICATE                      = 0x0020;
        const AUTHENTICATED_SIGNED_WRITES   = 0x0040;
        const RELIABLE_WRITE                = 0x0080;
        const WRITABLE_AUXILIARIES          = 0x0100;
        const ENCRYPT_READ                  = 0x0200;
        const ENCRYPT_WRITE                 = 0x0400;
        const ENCRYPT_AUTHENTICATED_READ    = 0x0800;
        const ENCRYPT_AUTHENTICATED_WRITE   = 0x1000;
    }
}

impl CharPropFlags {
    /// Parses the daemon's `Flags` string array (GattCharacteristic1.Flags).
    pub fn from_flag_strings<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut result = CharPropFlags::empty();
        for flag in flags {
            result |= match flag.as_ref() {
                "broadcast" => CharPropFlags::BROADCAST,
                "read" => CharPropFlags::READ,
                "write-without-response" => CharPropFlags::WRITE_WITHOUT_RESPONSE,
                "write" => CharPropFlags::WRITE,
                "notify" => CharPropFlags::NOTIFY,
                "indicate" => CharPropFlags::INDICATE,
                "authenticated-signed-writes" => CharPropFlags::AUTHENTICATED_SIGNED_WRITES,
                "reliable-write" => CharPropFlags::RELIABLE_WRITE,
                "writable-auxiliaries" => CharPropFlags::WRITABLE_AUXILIARIES,
                "encrypt-read" => CharPropFlags::ENCRYPT_READ,
                "encrypt-write" => CharPropFlags::ENCRYPT_WRITE,
                "encrypt-authenticated-read" => CharPropFlags::ENCRYPT_AUTHENTICATED_READ,
                "encrypt-authenticated-write" => CharPropFlags::ENCRYPT_AUTHENTICATED_WRITE,
                _ => CharPropFlags::empty(),
            };
        }
        result
    }
}

/// `WITH_RESPONSE` maps to bus write-option `type = "request"`,
/// `WITHOUT_RESPONSE` to `type = "command"` (§3, §6).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

impl WriteType {
    pub fn as_bluez_str(&self) -> &'static str {
        match self {
            WriteType::WithResponse => "request",
            WriteType::WithoutResponse => "command",
        }
    }
}

/// A snapshot tied to one advertisement or property burst (§3).
#[derive(Clone, Debug, Default)]
pub struct ScanResult {
    pub address: BDAddr,
    pub address_type: AddressType,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub last_update: Option<SystemTime>,
}

/// A GATT descriptor attached to a characteristic (§3).
#[derive(Clone, Debug)]
pub struct GattDescriptor {
    pub uuid: Uuid,
    pub object_path: String,
    pub value: Vec<u8>,
    pub flags: CharPropFlags,
}

/// A GATT characteristic, keyed within its service by UUID (§3).
#[derive(Clone, Debug)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub object_path: String,
    pub properties: CharPropFlags,
    pub value: Vec<u8>,
    pub notifying: bool,
    pub descriptors: Vec<GattDescriptor>,
}

impl GattCharacteristic {
    pub fn descriptor(&self, uuid: &Uuid) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| &d.uuid == uuid)
    }

    /// CCC descriptor controlling notifications/indications (Glossary).
    pub fn ccc_descriptor(&self) -> Option<&GattDescriptor> {
        let ccc: Uuid = crate::constants::CCC_DESCRIPTOR_UUID.parse().ok()?;
        self.descriptor(&ccc)
    }
}

/// A GATT service, replaced wholesale on each service discovery (§3).
#[derive(Clone, Debug)]
pub struct GattService {
    pub uuid: Uuid,
    pub object_path: String,
    pub primary: bool,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// The full GATT tree built once per connection episode, keyed both by bus
/// path (for signal lookup) and by (service UUID, characteristic UUID) for
/// API lookup (§4.7 "GATT tree construction"). The first occurrence of a
/// duplicate (service-uuid, characteristic-uuid) pair wins (§3).
#[derive(Clone, Debug, Default)]
pub struct GattTree {
    pub services: Vec<Arc<GattService>>,
    pub by_path: BTreeMap<String, GattLocator>,
}

/// Identifies a service, characteristic, or descriptor by its position in
/// [`GattTree::services`], used to resolve a bus path back to a live object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GattLocator {
    Service { service_idx: usize },
    Characteristic { service_idx: usize, char_idx: usize },
    Descriptor { service_idx: usize, char_idx: usize, desc_idx: usize },
}

impl GattTree {
    pub fn find_characteristic(&self, service_uuid: &Uuid, char_uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.services
            .iter()
            .find(|s| &s.uuid == service_uuid)
            .and_then(|s| s.characteristic(char_uuid))
    }
}

/// Scanner flags recognized by the Central (§4.6 "Scan options").
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ScanOptions {
    /// Suppress scan results whose advertised name is null.
    pub no_null_names: bool,
}

/// Delegate invoked by the [`crate::agent::PairingAgent`] for authentication
/// callbacks (§4.4). All methods have a default no-op/accept implementation
/// matching the "currently silently accept" / "accept" behavior the spec
/// assigns each callback absent application input.
pub trait PairingDelegate: Send + Sync {
    /// Called when a pairing attempt starts for `addr`.
    fn on_pairing_started(&self, _addr: BDAddr) {}

    /// Supplies a PIN code for `RequestPinCode`. `None` rejects the request.
    fn request_pin_code(&self, _addr: BDAddr) -> Option<String> {
        None
    }

    /// Supplies a passkey for `RequestPasskey`. `None` rejects the request.
    fn request_passkey(&self, _addr: BDAddr) -> Option<u32> {
        None
    }

    /// `RequestConfirmation` extension point; accepts by default.
    fn request_confirmation(&self, _addr: BDAddr, _passkey: u32) -> bool {
        true
    }

    /// Called before `RequestAuthorization` is accepted.
    fn on_authorization_requested(&self, _addr: BDAddr) {}
}

/// A [`PairingDelegate`] that rejects every interactive request, relying
/// entirely on a stored PIN (see `Central::set_pin`) or `just-works` pairing.
#[derive(Default)]
pub struct NullPairingDelegate;

impl PairingDelegate for NullPairingDelegate {}

/// Delegate invoked by a [`crate::peripheral::Peripheral`] for GATT
/// completions and peripheral-side bonding (§4.7). All methods default to
/// no-op; a caller that only cares about a subset overrides only those.
pub trait PeripheralDelegate: Send + Sync {
    /// Fired once per connection episode, after the GATT tree is built and
    /// before the `connected` callback (§4.7, §8 Scenario 3 ordering).
    fn on_services_discovered(&self, _addr: BDAddr) {}

    /// Completion of `read_characteristic`, or an unsolicited `Value` change
    /// while connected.
    fn on_characteristic_update(&self, _addr: BDAddr, _characteristic: Uuid, _value: Vec<u8>, _status: crate::error::ErrorKind) {}

    /// Completion of `write_characteristic`.
    fn on_characteristic_write(&self, _addr: BDAddr, _characteristic: Uuid, _status: crate::error::ErrorKind) {}

    /// Completion of `read_descriptor`, or an unsolicited `Value` change.
    fn on_descriptor_update(&self, _addr: BDAddr, _descriptor: Uuid, _value: Vec<u8>, _status: crate::error::ErrorKind) {}

    /// Completion of `write_descriptor`.
    fn on_descriptor_write(&self, _addr: BDAddr, _descriptor: Uuid, _status: crate::error::ErrorKind) {}

    /// Completion of `set_notify`, or an unsolicited `Notifying` change.
    fn on_notify_changed(&self, _addr: BDAddr, _characteristic: Uuid, _enabled: bool, _status: crate::error::ErrorKind) {}

    /// `Paired` became `true` after `create_bond` (§4.7 "Pairing from the
    /// peripheral side").
    fn on_bonding_succeeded(&self, _addr: BDAddr) {}

    /// `Paired` stayed `false` after a `create_bond` attempt.
    fn on_bonding_failed(&self, _addr: BDAddr) {}

    /// `Paired` transitioned from `true` to `false` while connected, outside
    /// of any `create_bond` attempt.
    fn on_bond_lost(&self, _addr: BDAddr) {}
}

/// A [`PeripheralDelegate`] that observes nothing.
#[derive(Default)]
pub struct NullPeripheralDelegate;

impl PeripheralDelegate for NullPeripheralDelegate {}
