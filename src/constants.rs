//! Well-known BlueZ bus names, interfaces, object paths, and default timing.

use std::time::Duration;

pub const BLUEZ_SERVICE: &str = "org.bluez";

pub const IFACE_ADAPTER: &str = "org.bluez.Adapter1";
pub const IFACE_DEVICE: &str = "org.bluez.Device1";
pub const IFACE_GATT_SERVICE: &str = "org.bluez.GattService1";
pub const IFACE_GATT_CHARACTERISTIC: &str = "org.bluez.GattCharacteristic1";
pub const IFACE_GATT_DESCRIPTOR: &str = "org.bluez.GattDescriptor1";
pub const IFACE_AGENT_MANAGER: &str = "org.bluez.AgentManager1";
pub const IFACE_AGENT: &str = "org.bluez.Agent1";

/// Well-known path our pairing agent is exported on (§6).
pub const AGENT_PATH: &str = "/test/agent";

/// Capability string advertised when registering the agent (§4.4/§6).
pub const AGENT_CAPABILITY: &str = "KeyboardOnly";

/// CCC descriptor UUID controlling notifications/indications (Glossary).
pub const CCC_DESCRIPTOR_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

/// Default timeout for individual blocking D-Bus method calls.
pub const METHOD_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Discovery time-slice: active scanning window (§4.6).
pub const SCAN_WINDOW: Duration = Duration::from_secs(6);

/// Discovery time-slice: full period between successive scan starts (§4.6).
pub const SCAN_INTERVAL: Duration = Duration::from_secs(8);

/// Pause between windows, derived as `SCAN_INTERVAL - SCAN_WINDOW`.
pub const SCAN_PAUSE: Duration = Duration::from_secs(2);

/// Service-discovery timeout armed on `Connected=true` (§4.7 step 5).
pub const SERVICE_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default retry cap stored on queued commands; never currently exercised (§9).
pub const DEFAULT_RETRY_CAP: u8 = 2;

/// Valid RSSI threshold range in dBm (§4.6, §8).
pub const RSSI_THRESHOLD_RANGE: std::ops::RangeInclusive<i16> = -127..=20;

pub mod filter_keys {
    pub const TRANSPORT: &str = "Transport";
    pub const RSSI: &str = "RSSI";
    pub const DUPLICATE_DATA: &str = "DuplicateData";
    pub const UUIDS: &str = "UUIDs";
    pub const PATHLOSS: &str = "Pathloss";
}

pub mod write_option_keys {
    pub const TYPE: &str = "type";
    pub const OFFSET: &str = "offset";
}
