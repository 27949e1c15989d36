//! Signal Router (§4.3, C2): the single process-wide dispatcher for
//! `InterfacesAdded` and `PropertiesChanged`, routing by object path /
//! device address to the owning Central or Peripheral.

use crate::api::BDAddr;
use crate::bus::Bus;
use dashmap::DashMap;
use dbus::arg::PropMap;
use dbus::blocking::stdintf::org_freedesktop_dbus::{
    ObjectManagerInterfacesAdded, PropertiesPropertiesChanged,
};
use dbus::channel::{MatchingReceiver, Token};
use dbus::message::MatchRule;
use dbus::Path;
use dbus_crossroads::Crossroads;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const IFACE_ADAPTER: &str = crate::constants::IFACE_ADAPTER;
pub const IFACE_DEVICE: &str = crate::constants::IFACE_DEVICE;
pub const IFACE_GATT_CHARACTERISTIC: &str = crate::constants::IFACE_GATT_CHARACTERISTIC;
pub const IFACE_GATT_DESCRIPTOR: &str = crate::constants::IFACE_GATT_DESCRIPTOR;

/// Implemented by [`crate::central::Central`]. Invoked on the Signal
/// Router's listener thread; implementations must post to their own signal
/// executor before doing further work (§4.3 "Dispatch is done on each
/// Central's signal executor").
pub trait CentralSink: Send + Sync {
    fn adapter_path(&self) -> Path<'static>;
    fn on_device_added(&self, device_path: Path<'static>, props: PropMap);
    fn on_adapter_properties_changed(&self, changed: PropMap);
    /// A `Device` PropertiesChanged for a device with no registered
    /// Peripheral — treated as a scan update (§4.3).
    fn on_device_properties_changed_unrouted(&self, device_path: Path<'static>, changed: PropMap);
}

/// Implemented by [`crate::peripheral::Peripheral`].
pub trait PeripheralSink: Send + Sync {
    fn object_path(&self) -> Path<'static>;
    fn on_device_properties_changed(&self, changed: PropMap);
    fn on_characteristic_properties_changed(&self, char_path: Path<'static>, changed: PropMap);
    fn on_descriptor_properties_changed(&self, desc_path: Path<'static>, changed: PropMap);
}

struct Registries {
    centrals: DashMap<String, Arc<dyn CentralSink>>,
    peripherals: DashMap<BDAddr, Arc<dyn PeripheralSink>>,
}

/// Process-wide singleton (§4.3). Owned by the top-level application, not a
/// static (§9 "global mutable state ... replaced by a lifetime-scoped
/// router").
pub struct SignalRouter {
    bus: Arc<Bus>,
    registries: Arc<Registries>,
    should_stop: Arc<AtomicBool>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    match_tokens: Mutex<Vec<Token>>,
    /// The Pairing Agent (and any other exported object) is served on this
    /// shared Crossroads instance, dispatched from the same listener thread
    /// that drives `InterfacesAdded`/`PropertiesChanged` (§4.4 ADDED).
    crossroads: Arc<Mutex<Crossroads>>,
}

impl SignalRouter {
    pub fn new(bus: Arc<Bus>) -> Arc<Self> {
        let registries = Arc::new(Registries {
            centrals: DashMap::new(),
            peripherals: DashMap::new(),
        });
        let should_stop = Arc::new(AtomicBool::new(false));

        let router = Arc::new(SignalRouter {
            bus,
            registries,
            should_stop,
            thread_handle: Mutex::new(None),
            match_tokens: Mutex::new(Vec::new()),
            crossroads: Arc::new(Mutex::new(Crossroads::new())),
        });

        router.install_matches();
        router.install_crossroads_receiver();
        router.start_listener_thread();
        router
    }

    /// Runs `f` with exclusive access to the shared Crossroads instance, for
    /// registering and exporting objects (e.g. the Pairing Agent) before
    /// messages start arriving.
    pub fn with_crossroads<R>(&self, f: impl FnOnce(&mut Crossroads) -> R) -> R {
        let mut cr = self.crossroads.lock().unwrap();
        f(&mut cr)
    }

    fn install_crossroads_receiver(self: &Arc<Self>) {
        let crossroads = self.crossroads.clone();
        self.bus.connection().start_receive(
            MatchRule::new(),
            Box::new(move |msg, conn| {
                if crossroads.lock().unwrap().handle_message(msg, conn).is_err() {
                    log::trace!("crossroads did not handle an incoming message");
                }
                true
            }),
        );
    }

    pub fn register_central(&self, adapter_path: Path<'static>, sink: Arc<dyn CentralSink>) {
        self.registries.centrals.insert(adapter_path.to_string(), sink);
    }

    pub fn unregister_central(&self, adapter_path: &Path<'static>) {
        self.registries.centrals.remove(&adapter_path.to_string());
    }

    pub fn register_peripheral(&self, address: BDAddr, sink: Arc<dyn PeripheralSink>) {
        self.registries.peripherals.insert(address, sink);
    }

    pub fn unregister_peripheral(&self, address: &BDAddr) {
        self.registries.peripherals.remove(address);
    }

    fn owning_central(registries: &Registries, path: &str) -> Option<Arc<dyn CentralSink>> {
        registries
            .centrals
            .iter()
            .find(|entry| path.starts_with(entry.key().as_str()))
            .map(|entry| entry.value().clone())
    }

    fn install_matches(self: &Arc<Self>) {
        let conn = self.bus.connection();

        let registries = self.registries.clone();
        let ia_token = conn
            .add_match(MatchRule::new(), move |args: ObjectManagerInterfacesAdded, _c, _msg| {
                if let Some(device_props) = args.interfaces.get(IFACE_DEVICE) {
                    if let Some(central) = Self::owning_central(&registries, &args.object) {
                        central.on_device_added(args.object.clone(), device_props.clone());
                    } else {
                        log::debug!("InterfacesAdded for {} has no owning Central", args.object);
                    }
                }
                true
            });

        let registries = self.registries.clone();
        let pc_token = conn.add_match(
            MatchRule::new(),
            move |args: PropertiesPropertiesChanged, _c, msg| {
                let path = match msg.path() {
                    Some(p) => p.into_static(),
                    None => return true,
                };
                match args.interface_name.as_str() {
                    IFACE_ADAPTER => {
                        if let Some(central) = Self::owning_central(&registries, &path) {
                            central.on_adapter_properties_changed(args.changed_properties.clone());
                        }
                    }
                    IFACE_DEVICE => {
                        let address = device_address_from_path(&path);
                        if let Some(addr) = address.and_then(|a| registries.peripherals.get(&a).map(|e| e.value().clone())) {
                            addr.on_device_properties_changed(args.changed_properties.clone());
                        } else if let Some(central) = Self::owning_central(&registries, &path) {
                            central.on_device_properties_changed_unrouted(path.clone(), args.changed_properties.clone());
                        }
                    }
                    IFACE_GATT_CHARACTERISTIC => {
                        if let Some(addr) = device_address_from_path(&path) {
                            if let Some(sink) = registries.peripherals.get(&addr) {
                                sink.value()
                                    .on_characteristic_properties_changed(path.clone(), args.changed_properties.clone());
                            }
                        }
                    }
                    IFACE_GATT_DESCRIPTOR => {
                        if let Some(addr) = device_address_from_path(&path) {
                            if let Some(sink) = registries.peripherals.get(&addr) {
                                sink.value()
                                    .on_descriptor_properties_changed(path.clone(), args.changed_properties.clone());
                            }
                        }
                    }
                    _ => {}
                }
                true
            },
        );

        match (ia_token, pc_token) {
            (Ok(a), Ok(b)) => {
                *self.match_tokens.lock().unwrap() = vec![a, b];
            }
            _ => {
                log::error!("failed to install signal router match rules");
            }
        }
    }

    fn start_listener_thread(self: &Arc<Self>) {
        let conn = self.bus.connection().clone();
        let should_stop = self.should_stop.clone();
        let handle = thread::Builder::new()
            .name("signal-router".to_string())
            .spawn(move || {
                while !should_stop.load(Ordering::Relaxed) {
                    if let Err(e) = conn.process(Duration::from_millis(200)) {
                        log::warn!("signal router bus processing error: {}", e);
                    }
                }
            })
            .expect("failed to spawn signal router thread");
        *self.thread_handle.lock().unwrap() = Some(handle);
    }

    pub fn shutdown(&self) {
        self.should_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Extracts a device's MAC from a bus path of the form
/// `/org/bluez/hciN/dev_XX_XX_XX_XX_XX_XX[/...]` (§6 "Bond object paths").
pub fn device_address_from_path(path: &str) -> Option<BDAddr> {
    let segment = path.split('/').find(|s| s.starts_with("dev_"))?;
    let hex = segment.strip_prefix("dev_")?;
    hex.replace('_', ":").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_address_from_device_path() {
        let addr = device_address_from_path("/org/bluez/hci0/dev_12_34_56_65_43_21");
        assert_eq!(addr, Some("12:34:56:65:43:21".parse().unwrap()));
    }

    #[test]
    fn extracts_address_from_characteristic_path() {
        let addr = device_address_from_path("/org/bluez/hci0/dev_12_34_56_65_43_21/service0025/char0026");
        assert_eq!(addr, Some("12:34:56:65:43:21".parse().unwrap()));
    }

    #[test]
    fn none_for_adapter_path() {
        assert_eq!(device_address_from_path("/org/bluez/hci0"), None);
    }
}
