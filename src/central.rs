//! Central Manager (§4.6, C6): owns one adapter, the discovery state
//! machine, scan filter state, the autoconnect registry, and the
//! peripheral registry.

use crate::agent::PairingAgent;
use crate::api::{BDAddr, NullPairingDelegate, PairingDelegate, ScanOptions, ScanResult};
use crate::bus::{Bus, BusObject};
use crate::command_queue::{Command, CommandQueue, CompletionTag};
use crate::constants::{filter_keys, IFACE_ADAPTER, RSSI_THRESHOLD_RANGE, SCAN_PAUSE, SCAN_WINDOW};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::Executor;
use crate::peripheral::Peripheral;
use crate::signal_router::{CentralSink, SignalRouter};
use dashmap::DashMap;
use dbus::arg::{PropMap, RefArg, Variant};
use dbus::Path;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Status delivered to a `connect`/`auto_connect` callback.
pub type ConnectCallback = Box<dyn Fn(BDAddr, ErrorKind) + Send + Sync>;
/// Status delivered to a `scan_any`/etc discovery callback.
pub type DiscoveryCallback = Arc<dyn Fn(Arc<Peripheral>, ScanResult) + Send + Sync>;

#[derive(Default)]
struct ScanFilterState {
    service_uuids: Vec<uuid::Uuid>,
    names: Vec<String>,
    addresses: HashSet<BDAddr>,
    rssi_threshold: Option<i16>,
}

struct DiscoveryState {
    normal_scan_active: bool,
    auto_scan_active: bool,
    window_timer: Option<crate::executor::TaskHandle>,
}

/// Owns one BlueZ adapter (§3 "at most one Adapter is active in a Central's
/// lifetime").
pub struct Central {
    bus: Arc<Bus>,
    signal_router: Arc<SignalRouter>,
    adapter_path: Path<'static>,

    callback_executor: Arc<Executor>,
    queue_executor: Arc<Executor>,
    signal_executor: Arc<Executor>,
    command_queue: Arc<CommandQueue>,

    peripherals: DashMap<BDAddr, Arc<Peripheral>>,
    autoconnect: DashMap<BDAddr, ConnectCallback>,

    discovery: Mutex<DiscoveryState>,
    filter: Mutex<ScanFilterState>,
    scan_options: Mutex<ScanOptions>,
    discovery_callback: RwLock<Option<DiscoveryCallback>>,

    agent: PairingAgent,
    self_ref: Mutex<Weak<Central>>,
}

static_assertions::assert_impl_all!(Central: Sync, Send);

impl Central {
    /// Enumerates adapters via the Bus Facade and picks the first by
    /// object-path sort order (SPEC_FULL §4.6 ADDED "Adapter selection").
    pub fn new(bus: Arc<Bus>, signal_router: Arc<SignalRouter>) -> Result<Arc<Self>> {
        let adapters = Self::list_adapter_paths(&bus)?;
        let path = adapters
            .into_iter()
            .next()
            .ok_or_else(|| Error::with_message(ErrorKind::BluezNotReady, "no bluetooth adapter present"))?;
        Self::with_adapter_path(bus, signal_router, path)
    }

    /// Binds to a specific adapter object path instead of picking the first.
    pub fn with_adapter(bus: Arc<Bus>, signal_router: Arc<SignalRouter>, adapter_name: &str) -> Result<Arc<Self>> {
        let path = format!("/org/bluez/{}", adapter_name);
        let path = Path::new(path).map_err(|e| Error::invalid_argument(e.to_string()))?;
        Self::with_adapter_path(bus, signal_router, path)
    }

    fn list_adapter_paths(bus: &Arc<Bus>) -> Result<Vec<Path<'static>>> {
        let objects = bus.managed_objects()?;
        let mut paths: Vec<Path<'static>> = objects
            .into_iter()
            .filter(|(_, ifaces)| ifaces.contains_key(IFACE_ADAPTER))
            .map(|(path, _)| path)
            .collect();
        paths.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        Ok(paths)
    }

    fn with_adapter_path(bus: Arc<Bus>, signal_router: Arc<SignalRouter>, path: Path<'static>) -> Result<Arc<Self>> {
        let queue_executor = Executor::new(format!("central-queue-{}", path));
        let central = Arc::new(Central {
            bus,
            signal_router: signal_router.clone(),
            adapter_path: path.clone(),
            callback_executor: Executor::new(format!("central-callback-{}", path)),
            queue_executor: queue_executor.clone(),
            signal_executor: Executor::new(format!("central-signal-{}", path)),
            command_queue: CommandQueue::new(queue_executor),
            peripherals: DashMap::new(),
            autoconnect: DashMap::new(),
            discovery: Mutex::new(DiscoveryState {
                normal_scan_active: false,
                auto_scan_active: false,
                window_timer: None,
            }),
            filter: Mutex::new(ScanFilterState::default()),
            scan_options: Mutex::new(ScanOptions::default()),
            discovery_callback: RwLock::new(None),
            agent: PairingAgent::new(Arc::new(NullPairingDelegate)),
            self_ref: Mutex::new(Weak::new()),
        });

        *central.self_ref.lock().unwrap() = Arc::downgrade(&central);
        signal_router.register_central(path, central.clone() as Arc<dyn CentralSink>);
        central.agent.register(&central.bus, &central.signal_router);

        Ok(central)
    }

    fn adapter(&self) -> BusObject {
        self.bus.object(self.adapter_path.clone(), IFACE_ADAPTER)
    }

    fn this(&self) -> Arc<Central> {
        self.self_ref
            .lock()
            .unwrap()
            .upgrade()
            .expect("Central always holds its own strong reference while alive")
    }

    pub fn set_pairing_delegate(&self, delegate: Arc<dyn PairingDelegate>) {
        self.agent.set_delegate(delegate);
    }

    pub fn set_discovery_callback(&self, cb: DiscoveryCallback) {
        *self.discovery_callback.write().unwrap() = Some(cb);
    }

    /// Stores a 6-digit PIN used for subsequent pairing attempts (§4.6
    /// `set_pin`, §8 boundary behavior).
    pub fn set_pin(&self, addr: BDAddr, pin: &str) -> bool {
        self.agent.set_pin(addr, pin)
    }

    // ---- Scanning (§4.6) ----------------------------------------------

    pub fn scan_any(self: &Arc<Self>) -> Result<()> {
        self.stop_scan_if_active()?;
        *self.filter.lock().unwrap() = ScanFilterState::default();
        self.begin_scan(true)
    }

    pub fn scan_services(self: &Arc<Self>, uuids: &[uuid::Uuid]) -> Result<()> {
        if uuids.is_empty() {
            return Err(Error::invalid_argument("scan_services requires a non-empty UUID list"));
        }
        self.stop_scan_if_active()?;
        {
            let mut f = self.filter.lock().unwrap();
            *f = ScanFilterState::default();
            f.service_uuids = uuids.to_vec();
        }
        self.begin_scan(true)
    }

    pub fn scan_names(self: &Arc<Self>, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Err(Error::invalid_argument("scan_names requires a non-empty name list"));
        }
        self.stop_scan_if_active()?;
        {
            let mut f = self.filter.lock().unwrap();
            *f = ScanFilterState::default();
            f.names = names.to_vec();
        }
        self.begin_scan(true)
    }

    pub fn scan_addresses(self: &Arc<Self>, addrs: &[BDAddr]) -> Result<()> {
        if addrs.is_empty() {
            return Err(Error::invalid_argument("scan_addresses requires a non-empty address list"));
        }
        self.stop_scan_if_active()?;
        {
            let mut f = self.filter.lock().unwrap();
            *f = ScanFilterState::default();
            f.addresses = addrs.iter().copied().collect();
        }
        self.begin_scan(true)
    }

    pub fn set_rssi_threshold(&self, dbm: i16) -> Result<()> {
        if !RSSI_THRESHOLD_RANGE.contains(&dbm) {
            return Err(Error::invalid_argument("rssi threshold out of [-127, 20]"));
        }
        self.filter.lock().unwrap().rssi_threshold = Some(dbm);
        Ok(())
    }

    pub fn set_scan_options(&self, options: ScanOptions) {
        *self.scan_options.lock().unwrap() = options;
    }

    /// Stops scan, pending scan results are dropped (§4.6 `stop_scan`).
    pub fn stop_scan(self: &Arc<Self>) -> Result<()> {
        {
            let mut d = self.discovery.lock().unwrap();
            d.normal_scan_active = false;
            if let Some(h) = d.window_timer.take() {
                h.cancel();
            }
        }
        self.issue_stop_discovery()
    }

    fn stop_scan_if_active(&self) -> Result<()> {
        let active = self.discovery.lock().unwrap().normal_scan_active;
        if active {
            self.issue_stop_discovery()?;
        }
        Ok(())
    }

    fn issue_stop_discovery(&self) -> Result<()> {
        let this = self.this();
        self.command_queue.enqueue(Command::new(CompletionTag::Discovering, None, move || {
            let _ = this.adapter().call_method::<_, ()>("StopDiscovery", ());
            this.command_queue.complete();
        }));
        Ok(())
    }

    /// Re-issues `SetDiscoveryFilter` then `StartDiscovery`, since the
    /// daemon does not persist filters across scan sessions (§4.6 "Scan
    /// filter application").
    fn begin_scan(self: &Arc<Self>, normal: bool) -> Result<()> {
        {
            let mut d = self.discovery.lock().unwrap();
            if normal {
                d.normal_scan_active = true;
            } else {
                d.auto_scan_active = true;
            }
        }

        let this = self.clone();
        self.command_queue.enqueue(Command::new(CompletionTag::Discovering, None, move || {
            let mut filter_dict: PropMap = PropMap::new();
            filter_dict.insert("Transport".to_string(), Variant(Box::new("le".to_string()) as Box<dyn RefArg>));
            let threshold = this.filter.lock().unwrap().rssi_threshold;
            if let Some(rssi) = threshold {
                filter_dict.insert(filter_keys::RSSI.to_string(), Variant(Box::new(rssi) as Box<dyn RefArg>));
            }
            filter_dict.insert(filter_keys::DUPLICATE_DATA.to_string(), Variant(Box::new(true) as Box<dyn RefArg>));
            let uuids = this.filter.lock().unwrap().service_uuids.clone();
            if !uuids.is_empty() {
                let strings: Vec<String> = uuids.iter().map(|u| u.to_string()).collect();
                filter_dict.insert(filter_keys::UUIDS.to_string(), Variant(Box::new(strings) as Box<dyn RefArg>));
            }

            if let Err(e) = this.adapter().call_method::<_, ()>("SetDiscoveryFilter", (filter_dict,)) {
                log::warn!("SetDiscoveryFilter failed: {:?}", e);
            }
            match this.adapter().call_method::<_, ()>("StartDiscovery", ()) {
                Ok(()) => {}
                Err(e) => log::warn!("StartDiscovery failed: {:?}", e),
            }
            this.command_queue.complete();
        }));

        self.arm_scan_window_timer();
        Ok(())
    }

    /// Discovery time-slicing: scan for `SCAN_WINDOW`, pause for
    /// `SCAN_PAUSE`, resume if either scan flag still holds (§4.6
    /// "Discovery scheduling").
    fn arm_scan_window_timer(self: &Arc<Self>) {
        let this = self.clone();
        let handle = self.signal_executor.post_delayed(
            move || {
                let _ = this.issue_stop_discovery();
                let resume = this.clone();
                resume.signal_executor.post_delayed(
                    move || {
                        let still_active = {
                            let d = resume.discovery.lock().unwrap();
                            d.normal_scan_active || d.auto_scan_active
                        };
                        if still_active {
                            let _ = resume.begin_scan(false);
                        }
                    },
                    SCAN_PAUSE,
                );
            },
            SCAN_WINDOW,
        );
        self.discovery.lock().unwrap().window_timer = Some(handle);
    }

    // ---- Connection management (§4.6) ---------------------------------

    pub fn get_peripheral(self: &Arc<Self>, addr: BDAddr) -> Arc<Peripheral> {
        if let Some(existing) = self.peripherals.get(&addr) {
            return existing.value().clone();
        }
        let device_path = device_path_for(&self.adapter_path, addr);
        let peripheral = Peripheral::new(self.bus.clone(), self.signal_router.clone(), device_path, addr);
        self.signal_router.register_peripheral(addr, peripheral.clone() as Arc<dyn crate::signal_router::PeripheralSink>);
        self.peripherals.insert(addr, peripheral.clone());
        peripheral
    }

    /// Parses and validates `addr`, delegating to `get_peripheral` (§4.6
    /// `get_peripheral`, §8 boundary behavior).
    pub fn get_peripheral_by_str(self: &Arc<Self>, addr: &str) -> Result<Arc<Peripheral>> {
        let addr: BDAddr = addr.parse().map_err(|_| Error::invalid_argument("malformed MAC address"))?;
        Ok(self.get_peripheral(addr))
    }

    /// No-op if already connected or connecting (§4.6 `connect`, §8
    /// idempotence).
    pub fn connect(self: &Arc<Self>, peripheral: &Arc<Peripheral>, cb: Option<ConnectCallback>) {
        if peripheral.is_connected_or_connecting() {
            return;
        }
        // Stop-scan only on the immediate connect path (§9 open question).
        let _ = self.stop_scan_if_active();
        peripheral.connect(cb);
    }

    pub fn auto_connect(&self, addr: BDAddr, peripheral: Arc<Peripheral>, cb: ConnectCallback) {
        self.autoconnect.insert(addr, cb);
        let _ = peripheral;
        self.ensure_background_scan();
    }

    pub fn auto_connect_batch(&self, entries: Vec<(BDAddr, Arc<Peripheral>, ConnectCallback)>) {
        for (addr, peripheral, cb) in entries {
            self.auto_connect(addr, peripheral, cb);
        }
    }

    fn ensure_background_scan(self: &Central) {
        let active = self.discovery.lock().unwrap().auto_scan_active;
        if !active {
            if let Some(this) = self.self_ref.lock().unwrap().upgrade() {
                let _ = this.begin_scan(false);
            }
        }
    }

    /// If connected: enqueue disconnect. If autoconnect-pending: remove and
    /// emit a synthetic disconnect (§4.6 `cancel_connection`).
    pub fn cancel_connection(self: &Arc<Self>, peripheral: &Arc<Peripheral>) {
        if self.autoconnect.remove(&peripheral.address()).is_some() {
            peripheral.emit_synthetic_disconnect();
            return;
        }
        peripheral.disconnect();
    }

    /// Calls `Adapter.RemoveDevice`; the daemon erases the bond (§4.6
    /// `remove_bond`).
    pub fn remove_bond(&self, addr: BDAddr) -> Result<()> {
        let device_path = device_path_for(&self.adapter_path, addr);
        self.adapter().call_method::<_, ()>("RemoveDevice", (device_path,))
    }

    pub fn shutdown(self: &Arc<Self>) {
        let _ = self.stop_scan();
        self.signal_router.unregister_central(&self.adapter_path);
        self.callback_executor.shutdown();
        self.signal_executor.shutdown();
        self.queue_executor.shutdown();
    }
}

/// Builds `/<adapter-path>/dev_XX_XX_XX_XX_XX_XX` for `addr` (§6 "Bond
/// object paths").
pub fn device_path_for(adapter_path: &Path<'static>, addr: BDAddr) -> Path<'static> {
    let suffix = format!("{:x}", addr).replace(':', "_").to_uppercase();
    let path = format!("{}/dev_{}", adapter_path, suffix);
    Path::new(path).expect("constructed device path is always valid")
}

impl CentralSink for Central {
    fn adapter_path(&self) -> Path<'static> {
        self.adapter_path.clone()
    }

    fn on_device_added(&self, device_path: Path<'static>, props: PropMap) {
        let this = self.this();
        self.signal_executor.post(move || {
            this.handle_device_added(device_path, props);
        });
    }

    fn on_adapter_properties_changed(&self, changed: PropMap) {
        let this = self.this();
        self.signal_executor.post(move || {
            this.handle_adapter_properties_changed(changed);
        });
    }

    fn on_device_properties_changed_unrouted(&self, device_path: Path<'static>, changed: PropMap) {
        let this = self.this();
        self.signal_executor.post(move || {
            this.handle_device_added(device_path, changed);
        });
    }
}

impl Central {
    fn handle_adapter_properties_changed(&self, changed: PropMap) {
        if let Some(discovering) = changed.get("Discovering").and_then(|v| v.as_i64()) {
            self.command_queue.try_complete_matching(&CompletionTag::Discovering, None);
            let _ = discovering;
        }
        if changed.get("Powered").is_some() {
            self.command_queue.try_complete_matching(&CompletionTag::Powered, None);
        }
    }

    fn handle_device_added(self: &Central, device_path: Path<'static>, props: PropMap) {
        let address = match props.get("Address").and_then(|v| v.as_str()) {
            Some(s) => match s.parse::<BDAddr>() {
                Ok(a) => a,
                Err(_) => return,
            },
            None => return,
        };

        let mut result = ScanResult {
            address,
            ..Default::default()
        };
        if let Some(name) = props.get("Name").and_then(|v| v.as_str()) {
            result.local_name = Some(name.to_string());
        }
        if let Some(kind) = props.get("AddressType").and_then(|v| v.as_str()) {
            result.address_type = kind.parse().unwrap_or_default();
        }
        if let Some(rssi) = props.get("RSSI").and_then(|v| v.as_i64()) {
            result.rssi = Some(rssi as i16);
        }
        if let Some(uuids) = props.get("UUIDs") {
            if let Some(iter) = uuids.0.as_iter() {
                for item in iter {
                    if let Some(s) = item.as_str() {
                        if let Ok(u) = s.parse() {
                            result.service_uuids.push(u);
                        }
                    }
                }
            }
        }
        if let Some(mfg) = props.get("ManufacturerData") {
            if let Some(mut iter) = mfg.0.as_iter() {
                while let (Some(id), Some(data)) = (iter.next(), iter.next()) {
                    if let (Some(id), Some(bytes)) = (id.as_u64(), decode_byte_variant(data)) {
                        result.manufacturer_data.insert(id as u16, bytes);
                    }
                }
            }
        }
        if let Some(svc_data) = props.get("ServiceData") {
            if let Some(mut iter) = svc_data.0.as_iter() {
                while let (Some(uuid), Some(data)) = (iter.next(), iter.next()) {
                    if let (Some(uuid), Some(bytes)) = (uuid.as_str().and_then(|s| s.parse().ok()), decode_byte_variant(data)) {
                        result.service_data.insert(uuid, bytes);
                    }
                }
            }
        }

        if !self.passes_filter(&result) {
            return;
        }

        let peripheral = if let Some(existing) = self.peripherals.get(&address) {
            existing.value().clone()
        } else if let Some(this) = self.self_ref.lock().unwrap().upgrade() {
            this.get_peripheral(address)
        } else {
            return;
        };
        peripheral.apply_scan_result(&result);

        if let Some(cb) = self.autoconnect.get(&address) {
            self.trigger_autoconnect(address, peripheral.clone(), cb.value());
        }

        if let Some(cb) = self.discovery_callback.read().unwrap().clone() {
            self.callback_executor.post(move || cb(peripheral, result));
        }
    }

    /// Autoconnect stops normal scanning, refreshes the device, and
    /// connects; afterwards background scanning resumes if the registry is
    /// non-empty, otherwise normal scan resumes if it was active (§4.6
    /// "Autoconnect").
    fn trigger_autoconnect(&self, address: BDAddr, peripheral: Arc<Peripheral>, _cb: &ConnectCallback) {
        let normal_was_active = {
            let mut d = self.discovery.lock().unwrap();
            std::mem::replace(&mut d.normal_scan_active, false)
        };
        let _ = self.issue_stop_discovery();
        peripheral.connect(None);

        if !self.autoconnect.is_empty() {
            self.ensure_background_scan();
        } else if normal_was_active {
            if let Some(this) = self.self_ref.lock().unwrap().upgrade() {
                let _ = this.begin_scan(true);
            }
        }
        let _ = address;
    }

    fn passes_filter(&self, result: &ScanResult) -> bool {
        let options = *self.scan_options.lock().unwrap();
        if options.no_null_names && result.local_name.is_none() {
            return false;
        }
        let filter = self.filter.lock().unwrap();
        if !filter.names.is_empty() {
            let matches = result
                .local_name
                .as_ref()
                .map(|n| filter.names.iter().any(|f| n.contains(f.as_str())))
                .unwrap_or(false);
            if !matches {
                return false;
            }
        }
        if !filter.addresses.is_empty() && !filter.addresses.contains(&result.address) {
            return false;
        }
        if !filter.service_uuids.is_empty() {
            let matches = result.service_uuids.iter().any(|u| filter.service_uuids.contains(u));
            if !matches {
                return false;
            }
        }
        true
    }
}

fn decode_byte_variant(value: &dyn RefArg) -> Option<Vec<u8>> {
    value
        .as_iter()?
        .next()?
        .as_iter()?
        .map(|b| b.as_u64().map(|v| v as u8))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_uses_uppercase_underscored_mac() {
        let adapter = Path::new("/org/bluez/hci0").unwrap();
        let addr: BDAddr = "12:34:56:65:43:21".parse().unwrap();
        assert_eq!(device_path_for(&adapter, addr).to_string(), "/org/bluez/hci0/dev_12_34_56_65_43_21");
    }
}
