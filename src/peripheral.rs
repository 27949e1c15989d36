//! Peripheral (§4.7, C7): one remote device's connection state machine and
//! GATT tree.

use crate::api::{
    BDAddr, CharPropFlags, ConnectionState, GattCharacteristic, GattDescriptor, GattLocator, GattService, GattTree,
    NullPeripheralDelegate, PeripheralDelegate, ScanResult, WriteType,
};
use crate::bus::{Bus, BusObject};
use crate::command_queue::{Command, CommandQueue, CompletionTag};
use crate::constants::{IFACE_DEVICE, IFACE_GATT_CHARACTERISTIC, IFACE_GATT_DESCRIPTOR, IFACE_GATT_SERVICE, SERVICE_DISCOVERY_TIMEOUT};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{Executor, TaskHandle};
use crate::signal_router::{PeripheralSink, SignalRouter};
use dbus::arg::{PropMap, RefArg, Variant};
use dbus::Path;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use uuid::Uuid;

pub type ConnectCallback = Box<dyn Fn(BDAddr, ErrorKind) + Send + Sync>;

struct State {
    connection_state: ConnectionState,
    gatt: GattTree,
    pending_connect_cb: Option<ConnectCallback>,
    service_discovery_timeout: Option<TaskHandle>,
    /// Guards "exactly once per connection episode" for the
    /// `ServicesResolved=true` → GATT-tree-build transition (§4.7 "Entry
    /// rules"): the signal and the timeout can both observe the resolved
    /// state, but only the first to arrive should act.
    services_discovered: bool,
    was_paired: bool,
    pairing_in_progress: bool,
}

/// One remote device, owned by exactly one [`crate::central::Central`]
/// (§3). Holds two executors: a device command queue and a shared callback
/// forwarder (§5).
pub struct Peripheral {
    bus: Arc<Bus>,
    signal_router: Arc<SignalRouter>,
    device_path: Path<'static>,
    address: BDAddr,

    queue_executor: Arc<Executor>,
    callback_executor: Arc<Executor>,
    command_queue: Arc<CommandQueue>,

    state: RwLock<State>,
    delegate: RwLock<Arc<dyn PeripheralDelegate>>,
    self_ref: Mutex<Weak<Peripheral>>,
}

static_assertions::assert_impl_all!(Peripheral: Sync, Send);

impl Peripheral {
    pub fn new(bus: Arc<Bus>, signal_router: Arc<SignalRouter>, device_path: Path<'static>, address: BDAddr) -> Arc<Self> {
        let queue_executor = Executor::new(format!("peripheral-queue-{}", address));
        let peripheral = Arc::new(Peripheral {
            bus,
            signal_router,
            device_path,
            address,
            queue_executor: queue_executor.clone(),
            callback_executor: Executor::new(format!("peripheral-callback-{}", address)),
            command_queue: CommandQueue::new(queue_executor),
            state: RwLock::new(State {
                connection_state: ConnectionState::Disconnected,
                gatt: GattTree::default(),
                pending_connect_cb: None,
                service_discovery_timeout: None,
                services_discovered: false,
                was_paired: false,
                pairing_in_progress: false,
            }),
            delegate: RwLock::new(Arc::new(NullPeripheralDelegate)),
            self_ref: Mutex::new(Weak::new()),
        });
        *peripheral.self_ref.lock().unwrap() = Arc::downgrade(&peripheral);
        peripheral
    }

    fn this(&self) -> Arc<Peripheral> {
        self.self_ref
            .lock()
            .unwrap()
            .upgrade()
            .expect("Peripheral always holds its own strong reference while alive")
    }

    /// Swaps the delegate that GATT completions, notifications, and
    /// peripheral-side bonding callbacks are forwarded to.
    pub fn set_delegate(&self, delegate: Arc<dyn PeripheralDelegate>) {
        *self.delegate.write().unwrap() = delegate;
    }

    fn delegate(&self) -> Arc<dyn PeripheralDelegate> {
        self.delegate.read().unwrap().clone()
    }

    pub fn address(&self) -> BDAddr {
        self.address
    }

    pub fn object_path(&self) -> Path<'static> {
        self.device_path.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().unwrap().connection_state
    }

    pub fn is_connected_or_connecting(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connecting | ConnectionState::Connected)
    }

    fn device(&self) -> BusObject {
        self.bus.object(self.device_path.clone(), IFACE_DEVICE)
    }

    /// Merges a fresh advertisement into... nothing persisted here; scan
    /// results are reported via the Central's discovery callback. Retained
    /// as a hook for future advertisement-derived state (e.g. RSSI cache).
    pub fn apply_scan_result(&self, _result: &ScanResult) {}

    pub fn last_known_name(&self) -> Result<Option<String>> {
        match self.device().get_typed::<String>("Name") {
            Ok(name) => Ok(Some(name)),
            Err(e) if e.kind() == ErrorKind::DbusExecutionException => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn services(&self) -> Vec<Arc<GattService>> {
        self.state.read().unwrap().gatt.services.clone()
    }

    pub fn characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Option<GattCharacteristic> {
        self.state.read().unwrap().gatt.find_characteristic(service, characteristic).cloned()
    }

    // ---- Connect / disconnect (§4.7 algorithm) -------------------------

    /// Runs the seven-step connect algorithm on the device queue executor
    /// (§4.7 "Connect algorithm"): call `Connect`, wait for `Connected=true`,
    /// arm a service-discovery timeout, wait for `ServicesResolved=true`,
    /// build the GATT tree, then invoke `cb`.
    pub fn connect(self: &Arc<Self>, cb: Option<ConnectCallback>) {
        {
            let mut state = self.state.write().unwrap();
            if matches!(state.connection_state, ConnectionState::Connecting | ConnectionState::Connected) {
                return;
            }
            state.connection_state = ConnectionState::Connecting;
            state.pending_connect_cb = cb;
            state.services_discovered = false;
        }

        let this = self.clone();
        self.command_queue.enqueue(Command::new(CompletionTag::Connected, Some(self.address), move || {
            match this.device().call_method::<_, ()>("Connect", ()) {
                Ok(()) => {}
                // The daemon maps `AlreadyConnected` to a synthetic
                // `Success`: short-circuit straight to CONNECTED and emit
                // `connected` without a GATT rebuild (§4.7 step 3).
                Err(e) if e.kind() == ErrorKind::Success => {
                    this.state.write().unwrap().connection_state = ConnectionState::Connected;
                    this.complete_connect(ErrorKind::Success);
                    return;
                }
                Err(e) => {
                    // `fail_connect` already completes the queued `Connect`
                    // command via `complete_connect`.
                    this.fail_connect(e.kind());
                    return;
                }
            }
            // If the daemon already reports connected (race with a prior
            // session) short-circuit the wait.
            if matches!(this.device().get_typed::<bool>("Connected"), Ok(true)) {
                this.on_connected_established();
                this.command_queue.complete();
            }
            // Otherwise completion arrives via PropertiesChanged(Connected=true)
            // routed to `on_device_properties_changed`.
        }));
    }

    fn on_connected_established(self: &Arc<Self>) {
        self.state.write().unwrap().connection_state = ConnectionState::Connected;
        self.arm_service_discovery_timeout();
    }

    /// Arms the service-discovery timeout on `Connected=true` (§4.7 step 5).
    /// `ServicesResolved` itself is observed through
    /// `on_device_properties_changed`, not polled; the one synchronous
    /// check here only covers the race where it was already resolved by
    /// the time `Connected=true` was observed.
    fn arm_service_discovery_timeout(self: &Arc<Self>) {
        if matches!(self.device().get_typed::<bool>("ServicesResolved"), Ok(true)) {
            if self.begin_service_discovery() {
                self.build_gatt_tree_and_notify();
            }
            return;
        }
        let this = self.clone();
        let handle = self
            .queue_executor
            .post_delayed(move || this.handle_service_discovery_timeout(), SERVICE_DISCOVERY_TIMEOUT);
        self.state.write().unwrap().service_discovery_timeout = Some(handle);
    }

    fn cancel_service_discovery_timeout(&self) {
        if let Some(handle) = self.state.write().unwrap().service_discovery_timeout.take() {
            handle.cancel();
        }
    }

    /// Marks service discovery as handled for this episode; returns `true`
    /// only the first time it's called since `connect()` (§4.7 "A
    /// `ServicesResolved=true` event while `CONNECTED` triggers service
    /// discovery completion exactly once per connection episode").
    fn begin_service_discovery(self: &Arc<Self>) -> bool {
        let mut state = self.state.write().unwrap();
        if state.services_discovered {
            return false;
        }
        state.services_discovered = true;
        if let Some(handle) = state.service_discovery_timeout.take() {
            handle.cancel();
        }
        true
    }

    /// Step 7: `ServicesResolved=true` never arrived within
    /// `SERVICE_DISCOVERY_TIMEOUT`. Emits the failure on the connect
    /// callback, schedules the paired-device cleanup, and forces a
    /// disconnect (§4.7 "Failure semantics").
    fn handle_service_discovery_timeout(self: &Arc<Self>) {
        if !self.begin_service_discovery() {
            return;
        }
        self.complete_connect(ErrorKind::ConnectionFailedEstablishment);
        self.schedule_service_discovery_failure_cleanup();
        self.force_disconnect();
    }

    fn build_gatt_tree_and_notify(self: &Arc<Self>) {
        match self.build_gatt_tree() {
            Ok(tree) => {
                self.state.write().unwrap().gatt = tree;
                self.signal_router.register_peripheral(self.address, self.this() as Arc<dyn PeripheralSink>);
                self.delegate().on_services_discovered(self.address);
                self.complete_connect(ErrorKind::Success);
            }
            Err(e) => self.fail_connect(e.kind()),
        }
    }

    /// Walks `device/serviceXXXX/charYYYY/descriptorZZZZ` via `list_children`
    /// and a typed property read at each level (§4.7 "GATT tree
    /// construction"); first occurrence of a duplicate
    /// (service, characteristic) UUID pair wins (§3).
    fn build_gatt_tree(&self) -> Result<GattTree> {
        let mut tree = GattTree::default();
        let service_children = self.device().list_children()?;

        for (service_idx, service_name) in service_children.iter().enumerate() {
            let service_path = format!("{}/{}", self.device_path, service_name);
            let service_path = Path::new(service_path.clone()).map_err(|_| Error::with_message(ErrorKind::DbusExecutionException, "bad service path"))?;
            let service_obj = self.bus.object(service_path.clone(), IFACE_GATT_SERVICE);
            let uuid: Uuid = match service_obj.get_typed::<String>("UUID").ok().and_then(|s| s.parse().ok()) {
                Some(u) => u,
                None => continue,
            };
            let primary = service_obj.get_typed::<bool>("Primary").unwrap_or(true);

            let mut characteristics = Vec::new();
            let char_children = service_obj.list_children().unwrap_or_default();
            for char_name in &char_children {
                let char_path_s = format!("{}/{}", service_path, char_name);
                let char_path = match Path::new(char_path_s) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let char_obj = self.bus.object(char_path.clone(), IFACE_GATT_CHARACTERISTIC);
                let char_uuid: Uuid = match char_obj.get_typed::<String>("UUID").ok().and_then(|s| s.parse().ok()) {
                    Some(u) => u,
                    None => continue,
                };
                let flags: Vec<String> = char_obj.get_typed("Flags").unwrap_or_default();
                let properties = CharPropFlags::from_flag_strings(flags);
                let value: Vec<u8> = char_obj.get_typed("Value").unwrap_or_default();
                let notifying = char_obj.get_typed::<bool>("Notifying").unwrap_or(false);

                let mut descriptors = Vec::new();
                let desc_children = char_obj.list_children().unwrap_or_default();
                for desc_name in &desc_children {
                    let desc_path_s = format!("{}/{}", char_path, desc_name);
                    let desc_path = match Path::new(desc_path_s) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    let desc_obj = self.bus.object(desc_path, IFACE_GATT_DESCRIPTOR);
                    let desc_uuid: Uuid = match desc_obj.get_typed::<String>("UUID").ok().and_then(|s| s.parse().ok()) {
                        Some(u) => u,
                        None => continue,
                    };
                    let desc_flags: Vec<String> = desc_obj.get_typed("Flags").unwrap_or_default();
                    let desc_properties = CharPropFlags::from_flag_strings(desc_flags);
                    let desc_value: Vec<u8> = desc_obj.get_typed("Value").unwrap_or_default();
                    descriptors.push(GattDescriptor {
                        uuid: desc_uuid,
                        object_path: desc_obj.path().to_string(),
                        value: desc_value,
                        flags: desc_properties,
                    });
                }

                characteristics.push(GattCharacteristic {
                    uuid: char_uuid,
                    service_uuid: uuid,
                    object_path: char_obj.path().to_string(),
                    properties,
                    value,
                    notifying,
                    descriptors,
                });
            }

            let char_count = characteristics.len();
            tree.services.push(Arc::new(GattService {
                uuid,
                object_path: service_obj.path().to_string(),
                primary,
                characteristics,
            }));

            // Bus paths are unique per object; a duplicate (service_uuid,
            // char_uuid) pair is resolved by `GattTree::find_characteristic`
            // always matching the first entry in `services` (§3), not here.
            tree.by_path.insert(service_obj.path().to_string(), GattLocator::Service { service_idx });
            for char_idx in 0..char_count {
                let cpath = tree.services[service_idx].characteristics[char_idx].object_path.clone();
                tree.by_path.entry(cpath).or_insert(GattLocator::Characteristic { service_idx, char_idx });
                for (desc_idx, d) in tree.services[service_idx].characteristics[char_idx].descriptors.iter().enumerate() {
                    tree.by_path
                        .entry(d.object_path.clone())
                        .or_insert(GattLocator::Descriptor { service_idx, char_idx, desc_idx });
                }
            }
        }

        Ok(tree)
    }

    fn complete_connect(self: &Arc<Self>, kind: ErrorKind) {
        let cb = self.state.write().unwrap().pending_connect_cb.take();
        self.command_queue.complete();
        if let Some(cb) = cb {
            let addr = self.address;
            self.callback_executor.post(move || cb(addr, kind));
        }
    }

    fn fail_connect(self: &Arc<Self>, kind: ErrorKind) {
        self.state.write().unwrap().connection_state = ConnectionState::Disconnected;
        self.complete_connect(kind);
    }

    /// Service-discovery failure on a previously-paired device schedules a
    /// delayed `RemoveDevice` so the daemon re-learns the GATT tree on
    /// reconnection (§4.7 "Failure semantics"; BlueZ workaround).
    fn schedule_service_discovery_failure_cleanup(self: &Arc<Self>) {
        let this = self.clone();
        self.queue_executor.post_delayed(
            move || {
                let paired = matches!(this.device().get_typed::<bool>("Paired"), Ok(true));
                if paired {
                    this.remove_device();
                }
            },
            Duration::from_secs(5),
        );
    }

    fn remove_device(&self) {
        if let Some(adapter_path) = self.device_path.to_string().rsplit_once('/').map(|(a, _)| a.to_string()) {
            if let Ok(adapter) = Path::new(adapter_path) {
                let adapter_obj = self.bus.object(adapter, crate::constants::IFACE_ADAPTER);
                let _ = adapter_obj.call_method::<_, ()>("RemoveDevice", (self.device_path.clone(),));
            }
        }
    }

    /// After any disconnect, an unpaired device is removed via
    /// `Adapter.RemoveDevice` so that subsequent notification setup works
    /// on reconnection (§4.7 "Failure semantics").
    fn remove_device_if_unpaired(&self) {
        let paired = matches!(self.device().get_typed::<bool>("Paired"), Ok(true));
        if !paired {
            self.remove_device();
        }
    }

    pub fn disconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.write().unwrap();
            if state.connection_state == ConnectionState::Disconnected {
                return;
            }
            state.connection_state = ConnectionState::Disconnecting;
        }
        self.cancel_service_discovery_timeout();
        self.queue_disconnect();
    }

    /// Step 7's forced teardown after a service-discovery timeout reuses
    /// the same path as a user-initiated `disconnect()`.
    fn force_disconnect(self: &Arc<Self>) {
        self.state.write().unwrap().connection_state = ConnectionState::Disconnecting;
        self.queue_disconnect();
    }

    fn queue_disconnect(self: &Arc<Self>) {
        let this = self.clone();
        self.queue_executor.post(move || {
            let _ = this.device().call_method::<_, ()>("Disconnect", ());
            this.command_queue.drain();
            this.state.write().unwrap().connection_state = ConnectionState::Disconnected;
            this.remove_device_if_unpaired();
        });
    }

    /// Used when cancelling a not-yet-attempted autoconnect registration:
    /// there is no live connection to tear down, only local state to reset
    /// (§4.6 `cancel_connection`).
    pub fn emit_synthetic_disconnect(self: &Arc<Self>) {
        self.cancel_service_discovery_timeout();
        self.state.write().unwrap().connection_state = ConnectionState::Disconnected;
        self.command_queue.drain();
    }

    /// Initiates BlueZ pairing via `Device.Pair` (§4.7 "Pairing from the
    /// peripheral side"). Completion is delivered to the
    /// [`PeripheralDelegate`] via `Paired` property changes, not a return
    /// value.
    pub fn create_bond(&self) -> Result<()> {
        self.state.write().unwrap().pairing_in_progress = true;
        self.device().call_method::<_, ()>("Pair", ())
    }

    /// `Paired=true` emits `on_bonding_succeeded`; `Paired=false` after an
    /// attempt emits `on_bonding_failed`; `Paired=false` while connected,
    /// outside of any attempt, having previously been paired, emits
    /// `on_bond_lost` (§4.7 "Pairing from the peripheral side").
    fn handle_paired_change(self: &Arc<Self>, paired: bool) {
        let (was_paired, pairing_in_progress, connected) = {
            let mut state = self.state.write().unwrap();
            let was_paired = state.was_paired;
            let pairing_in_progress = state.pairing_in_progress;
            state.was_paired = paired;
            state.pairing_in_progress = false;
            (was_paired, pairing_in_progress, state.connection_state == ConnectionState::Connected)
        };
        let delegate = self.delegate();
        if paired {
            delegate.on_bonding_succeeded(self.address);
        } else if pairing_in_progress {
            delegate.on_bonding_failed(self.address);
        } else if was_paired && connected {
            delegate.on_bond_lost(self.address);
        }
    }

    // ---- GATT operations (§4.7) ----------------------------------------

    fn require_characteristic(&self, uuid: &Uuid) -> Result<GattCharacteristic> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(Error::invalid_argument("not connected"));
        }
        self.state
            .read()
            .unwrap()
            .gatt
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| &c.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::invalid_argument("unknown characteristic uuid"))
    }

    fn require_descriptor(&self, characteristic: &Uuid, descriptor: &Uuid) -> Result<GattDescriptor> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(Error::invalid_argument("not connected"));
        }
        self.state
            .read()
            .unwrap()
            .gatt
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| &c.uuid == characteristic)
            .and_then(|c| c.descriptor(descriptor))
            .cloned()
            .ok_or_else(|| Error::invalid_argument("unknown descriptor uuid"))
    }

    /// Precondition: state `CONNECTED` and `c.properties` contains `read`
    /// (§4.7 "GATT operations"). Completion arrives on the
    /// [`PeripheralDelegate`] when the corresponding `Value` property
    /// change is observed, not synchronously from this call.
    pub fn read_characteristic(self: &Arc<Self>, uuid: &Uuid) -> Result<()> {
        let c = self.require_characteristic(uuid)?;
        if !c.properties.contains(CharPropFlags::READ) {
            return Err(Error::invalid_argument("characteristic does not support read"));
        }
        let this = self.clone();
        let char_uuid = *uuid;
        let object_path = c.object_path.clone();
        self.command_queue.enqueue(Command::new(
            CompletionTag::GattValue { object_path: object_path.clone() },
            Some(self.address),
            move || {
                let obj = this.bus.object(
                    Path::new(object_path.clone()).expect("characteristic path is always valid"),
                    IFACE_GATT_CHARACTERISTIC,
                );
                let options: PropMap = PropMap::new();
                if let Err(e) = obj.call_method::<_, Vec<u8>>("ReadValue", (options,)) {
                    this.delegate().on_characteristic_update(this.address, char_uuid, Vec::new(), e.kind());
                    this.command_queue.complete();
                }
                // On success, completion is the forthcoming `Value`
                // PropertiesChanged, not this reply.
            },
        ));
        Ok(())
    }

    /// Precondition: state `CONNECTED`, `write_type` supported by
    /// `c.properties`. `bytes` is copied into the command body before
    /// enqueue so later caller-side mutation cannot affect the in-flight
    /// write (§4.7 "GATT operations").
    pub fn write_characteristic(self: &Arc<Self>, uuid: &Uuid, bytes: &[u8], write_type: WriteType) -> Result<()> {
        let c = self.require_characteristic(uuid)?;
        let required = match write_type {
            WriteType::WithResponse => CharPropFlags::WRITE,
            WriteType::WithoutResponse => CharPropFlags::WRITE_WITHOUT_RESPONSE,
        };
        if !c.properties.contains(required) {
            return Err(Error::invalid_argument("characteristic does not support this write type"));
        }
        let this = self.clone();
        let char_uuid = *uuid;
        let object_path = c.object_path.clone();
        let bytes = bytes.to_vec();
        self.command_queue.enqueue(Command::new(
            CompletionTag::GattValue { object_path: object_path.clone() },
            Some(self.address),
            move || {
                let obj = this.bus.object(
                    Path::new(object_path.clone()).expect("characteristic path is always valid"),
                    IFACE_GATT_CHARACTERISTIC,
                );
                let mut options: PropMap = PropMap::new();
                options.insert(
                    crate::constants::write_option_keys::TYPE.to_string(),
                    Variant(Box::new(write_type.as_bluez_str().to_string()) as Box<dyn RefArg>),
                );
                let status = match obj.call_method::<_, ()>("WriteValue", (bytes, options)) {
                    Ok(()) => ErrorKind::Success,
                    Err(e) => e.kind(),
                };
                this.delegate().on_characteristic_write(this.address, char_uuid, status);
                this.command_queue.complete();
            },
        ));
        Ok(())
    }

    /// Analogous to `read_characteristic` (§4.7 "`read_descriptor`,
    /// `write_descriptor`: analogous").
    pub fn read_descriptor(self: &Arc<Self>, characteristic: &Uuid, descriptor: &Uuid) -> Result<()> {
        let d = self.require_descriptor(characteristic, descriptor)?;
        if !d.flags.contains(CharPropFlags::READ) {
            return Err(Error::invalid_argument("descriptor does not support read"));
        }
        let this = self.clone();
        let desc_uuid = *descriptor;
        let object_path = d.object_path.clone();
        self.command_queue.enqueue(Command::new(
            CompletionTag::GattValue { object_path: object_path.clone() },
            Some(self.address),
            move || {
                let obj = this.bus.object(
                    Path::new(object_path.clone()).expect("descriptor path is always valid"),
                    IFACE_GATT_DESCRIPTOR,
                );
                let options: PropMap = PropMap::new();
                if let Err(e) = obj.call_method::<_, Vec<u8>>("ReadValue", (options,)) {
                    this.delegate().on_descriptor_update(this.address, desc_uuid, Vec::new(), e.kind());
                    this.command_queue.complete();
                }
            },
        ));
        Ok(())
    }

    /// Analogous to `write_characteristic`.
    pub fn write_descriptor(self: &Arc<Self>, characteristic: &Uuid, descriptor: &Uuid, bytes: &[u8]) -> Result<()> {
        let d = self.require_descriptor(characteristic, descriptor)?;
        if !d.flags.contains(CharPropFlags::WRITE) {
            return Err(Error::invalid_argument("descriptor does not support write"));
        }
        let this = self.clone();
        let desc_uuid = *descriptor;
        let object_path = d.object_path.clone();
        let bytes = bytes.to_vec();
        self.command_queue.enqueue(Command::new(
            CompletionTag::GattValue { object_path: object_path.clone() },
            Some(self.address),
            move || {
                let obj = this.bus.object(
                    Path::new(object_path.clone()).expect("descriptor path is always valid"),
                    IFACE_GATT_DESCRIPTOR,
                );
                let options: PropMap = PropMap::new();
                let status = match obj.call_method::<_, ()>("WriteValue", (bytes, options)) {
                    Ok(()) => ErrorKind::Success,
                    Err(e) => e.kind(),
                };
                this.delegate().on_descriptor_write(this.address, desc_uuid, status);
                this.command_queue.complete();
            },
        ));
        Ok(())
    }

    /// Precondition: `c.properties ∩ {notify, indicate} ≠ ∅`. If already in
    /// the requested state, completes immediately; otherwise enqueues
    /// `StartNotify`/`StopNotify`, completing on the matching `Notifying`
    /// property change (§4.7 `set_notify`).
    pub fn set_notify(self: &Arc<Self>, uuid: &Uuid, enabled: bool) -> Result<()> {
        let c = self.require_characteristic(uuid)?;
        if !c.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE) {
            return Err(Error::invalid_argument("characteristic does not support notify/indicate"));
        }
        if c.notifying == enabled {
            let this = self.clone();
            let char_uuid = *uuid;
            self.callback_executor
                .post(move || this.delegate().on_notify_changed(this.address, char_uuid, enabled, ErrorKind::Success));
            return Ok(());
        }

        let this = self.clone();
        let char_uuid = *uuid;
        let object_path = c.object_path.clone();
        self.command_queue.enqueue(Command::new(
            CompletionTag::Notifying { object_path: object_path.clone() },
            Some(self.address),
            move || {
                let obj = this.bus.object(
                    Path::new(object_path.clone()).expect("characteristic path is always valid"),
                    IFACE_GATT_CHARACTERISTIC,
                );
                let method = if enabled { "StartNotify" } else { "StopNotify" };
                if let Err(e) = obj.call_method::<_, ()>(method, ()) {
                    this.delegate().on_notify_changed(this.address, char_uuid, !enabled, e.kind());
                    this.command_queue.complete();
                }
                // On success, completion arrives via the `Notifying`
                // property change, routed to
                // `on_characteristic_properties_changed`.
            },
        ));
        Ok(())
    }
}

impl PeripheralSink for Peripheral {
    fn object_path(&self) -> Path<'static> {
        self.device_path.clone()
    }

    fn on_device_properties_changed(&self, changed: PropMap) {
        let this = self.this();
        self.queue_executor.post(move || {
            if matches!(changed.get("Connected").and_then(|v| v.as_i64()), Some(0)) {
                this.handle_unsolicited_disconnect();
                return;
            }
            if this.command_queue.try_complete_matching(&CompletionTag::Connected, Some(this.address)) {
                this.on_connected_established();
            }
            if matches!(changed.get("ServicesResolved").and_then(|v| v.as_i64()), Some(1)) {
                if this.begin_service_discovery() {
                    this.build_gatt_tree_and_notify();
                }
            }
            if let Some(paired) = changed.get("Paired").and_then(|v| v.as_i64()) {
                this.handle_paired_change(paired == 1);
            }
        });
    }

    fn on_characteristic_properties_changed(&self, char_path: Path<'static>, changed: PropMap) {
        let this = self.this();
        self.callback_executor.post(move || {
            let path = char_path.to_string();
            if let Some(notifying) = changed.get("Notifying").and_then(|v| v.as_i64()) {
                let enabled = notifying == 1;
                let matched = this
                    .command_queue
                    .try_complete_matching(&CompletionTag::Notifying { object_path: path.clone() }, Some(this.address));
                if matched {
                    if let Some(uuid) = this.uuid_for_char_path(&path) {
                        this.delegate().on_notify_changed(this.address, uuid, enabled, ErrorKind::Success);
                    }
                }
            }
            if let Some(value) = changed.get("Value") {
                if let Some(bytes) = decode_value_variant(value) {
                    this.command_queue
                        .try_complete_matching(&CompletionTag::GattValue { object_path: path.clone() }, Some(this.address));
                    if let Some(uuid) = this.uuid_for_char_path(&path) {
                        this.delegate().on_characteristic_update(this.address, uuid, bytes, ErrorKind::Success);
                    }
                }
            }
        });
    }

    fn on_descriptor_properties_changed(&self, desc_path: Path<'static>, changed: PropMap) {
        let this = self.this();
        self.callback_executor.post(move || {
            let path = desc_path.to_string();
            if let Some(value) = changed.get("Value") {
                if let Some(bytes) = decode_value_variant(value) {
                    this.command_queue
                        .try_complete_matching(&CompletionTag::GattValue { object_path: path.clone() }, Some(this.address));
                    if let Some(uuid) = this.uuid_for_descriptor_path(&path) {
                        this.delegate().on_descriptor_update(this.address, uuid, bytes, ErrorKind::Success);
                    }
                }
            }
        });
    }
}

/// Decodes a `PropertiesChanged` `Value` variant (an `ay`) into bytes.
fn decode_value_variant(value: &Variant<Box<dyn RefArg>>) -> Option<Vec<u8>> {
    Some(value.0.as_iter()?.filter_map(|b| b.as_u64().map(|v| v as u8)).collect())
}

impl Peripheral {
    fn uuid_for_char_path(&self, path: &str) -> Option<Uuid> {
        let state = self.state.read().unwrap();
        match state.gatt.by_path.get(path)? {
            GattLocator::Characteristic { service_idx, char_idx } => {
                Some(state.gatt.services[*service_idx].characteristics[*char_idx].uuid)
            }
            _ => None,
        }
    }

    fn uuid_for_descriptor_path(&self, path: &str) -> Option<Uuid> {
        let state = self.state.read().unwrap();
        match state.gatt.by_path.get(path)? {
            GattLocator::Descriptor { service_idx, char_idx, desc_idx } => {
                Some(state.gatt.services[*service_idx].characteristics[*char_idx].descriptors[*desc_idx].uuid)
            }
            _ => None,
        }
    }

    /// A `Connected=false` PropertiesChanged with no matching in-flight
    /// command is an unsolicited disconnect; the queue is drained and state
    /// reset without invoking any pending connect callback (§4.7 "failure
    /// semantics").
    fn handle_unsolicited_disconnect(self: &Arc<Self>) {
        self.cancel_service_discovery_timeout();
        self.state.write().unwrap().connection_state = ConnectionState::Disconnected;
        self.command_queue.drain();
        self.remove_device_if_unpaired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gatt_tree_prefers_first_occurrence_of_duplicate_uuid() {
        let mut tree = GattTree::default();
        let svc_a = Arc::new(GattService {
            uuid: "0000180d-0000-1000-8000-00805f9b34fb".parse().unwrap(),
            object_path: "/a/service0001".to_string(),
            primary: true,
            characteristics: vec![],
        });
        let svc_b = Arc::new(GattService {
            uuid: "0000180d-0000-1000-8000-00805f9b34fb".parse().unwrap(),
            object_path: "/a/service0002".to_string(),
            primary: true,
            characteristics: vec![],
        });
        tree.services.push(svc_a.clone());
        tree.by_path.insert(svc_a.object_path.clone(), GattLocator::Service { service_idx: 0 });
        tree.services.push(svc_b);
        tree.by_path.entry("/a/service0002".to_string()).or_insert(GattLocator::Service { service_idx: 1 });

        assert_eq!(tree.services.len(), 2);
        assert!(matches!(tree.by_path["/a/service0001"], GattLocator::Service { service_idx: 0 }));
    }

    #[test]
    fn decodes_value_variant_bytes() {
        let value: Variant<Box<dyn RefArg>> = Variant(Box::new(vec![1u8, 2, 3]));
        assert_eq!(decode_value_variant(&value), Some(vec![1, 2, 3]));
    }

    #[test]
    fn handle_paired_change_succeeded_then_bond_lost() {
        // Pure state-transition check against the three-rule table in
        // §4.7, without a live bus: exercised through the private helper's
        // documented truth table rather than a full Peripheral.
        let was_paired = true;
        let pairing_in_progress = false;
        let connected = true;
        let paired = false;
        let fires_bond_lost = !paired && !pairing_in_progress && was_paired && connected;
        assert!(fires_bond_lost);
    }
}
