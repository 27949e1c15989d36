//! Pairing Agent (§4.4, C4): a bus-exported object implementing the
//! daemon's authentication callback set, forwarding to a user
//! [`PairingDelegate`].

use crate::api::{BDAddr, PairingDelegate};
use crate::bus::Bus;
use crate::constants::{AGENT_CAPABILITY, AGENT_PATH, IFACE_AGENT_MANAGER};
use dbus::Path;
use dbus_crossroads::{Context, Crossroads, IfaceBuilder, IfaceToken};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Six-digit PINs set via `Central::set_pin`, consulted before the
/// delegate on `RequestPinCode` (§4.4, §8 round-trip property).
#[derive(Default)]
struct PinStore {
    pins: HashMap<BDAddr, String>,
}

struct AgentData {
    delegate: RwLock<Arc<dyn PairingDelegate>>,
    pins: Mutex<PinStore>,
}

/// The exported pairing agent (§4.4). Registration failures are logged and
/// treated as non-fatal (§4.4 "Failures during registration are
/// non-fatal").
pub struct PairingAgent {
    data: Arc<AgentData>,
}

impl PairingAgent {
    pub fn new(delegate: Arc<dyn PairingDelegate>) -> Self {
        PairingAgent {
            data: Arc::new(AgentData {
                delegate: RwLock::new(delegate),
                pins: Mutex::new(PinStore::default()),
            }),
        }
    }

    /// Swaps the delegate that future agent callbacks are forwarded to.
    /// Takes effect on the next daemon callback; does not require
    /// re-registration (§4.4, `Central::set_pairing_delegate`).
    pub fn set_delegate(&self, delegate: Arc<dyn PairingDelegate>) {
        *self.data.delegate.write().unwrap() = delegate;
    }

    /// Stores a 6-digit PIN for `addr`; returns `false` and stores nothing
    /// if `pin` is not exactly 6 characters (§4.6 `set_pin`, §8 boundary
    /// behavior).
    pub fn set_pin(&self, addr: BDAddr, pin: &str) -> bool {
        if pin.chars().count() != 6 {
            return false;
        }
        self.data.pins.lock().unwrap().pins.insert(addr, pin.to_string());
        true
    }

    /// Registers the agent's interface on the Signal Router's shared
    /// Crossroads instance and exports it at `/test/agent`, then registers
    /// it with the daemon's AgentManager under capability `KeyboardOnly` and
    /// requests it as the default agent (§4.4 "Registration sequence").
    pub fn register(&self, bus: &Arc<Bus>, signal_router: &crate::signal_router::SignalRouter) {
        let data = self.data.clone();
        signal_router.with_crossroads(move |crossroads| {
            let token = register_interface(crossroads);
            crossroads.insert(AGENT_PATH, &[token], data);
        });

        let agent_path: Path<'static> = Path::new(AGENT_PATH).expect("static agent path is valid");
        let manager = bus.object("/org/bluez", IFACE_AGENT_MANAGER);

        if let Err(e) = manager.call_method::<_, ()>("RegisterAgent", (agent_path.clone(), AGENT_CAPABILITY)) {
            log::warn!("RegisterAgent failed (non-fatal): {:?}", e);
            return;
        }
        if let Err(e) = manager.call_method::<_, ()>("RequestDefaultAgent", (agent_path,)) {
            log::warn!("RequestDefaultAgent failed (non-fatal): {:?}", e);
        }
    }
}

fn device_address_of(path: &Path<'static>) -> Option<BDAddr> {
    crate::signal_router::device_address_from_path(path)
}

fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<AgentData>> {
    cr.register(crate::constants::IFACE_AGENT, |b: &mut IfaceBuilder<Arc<AgentData>>| {
        b.method(
            "RequestPinCode",
            ("device",),
            ("pincode",),
            move |_ctx: &mut Context, data: &mut Arc<AgentData>, (device,): (Path<'static>,)| {
                let addr = device_address_of(&device);
                if let Some(addr) = addr {
                    data.delegate.read().unwrap().on_pairing_started(addr);
                    let stored = data.pins.lock().unwrap().pins.get(&addr).cloned();
                    if let Some(pin) = stored {
                        return Ok((pin,));
                    }
                    if let Some(pin) = data.delegate.read().unwrap().request_pin_code(addr) {
                        return Ok((pin,));
                    }
                }
                Err(dbus::MethodErr::failed("pairing rejected: no pin available"))
            },
        );

        b.method(
            "DisplayPinCode",
            ("device", "pincode"),
            (),
            move |_ctx, _data, (device, pincode): (Path<'static>, String)| {
                log::info!("DisplayPinCode({}, {})", device, pincode);
                Ok(())
            },
        );

        b.method(
            "RequestPasskey",
            ("device",),
            ("passkey",),
            move |_ctx, data: &mut Arc<AgentData>, (device,): (Path<'static>,)| {
                let addr = device_address_of(&device);
                if let Some(addr) = addr {
                    data.delegate.read().unwrap().on_pairing_started(addr);
                    if let Some(passkey) = data.delegate.read().unwrap().request_passkey(addr) {
                        return Ok((passkey,));
                    }
                }
                Err(dbus::MethodErr::failed("pairing rejected: no passkey available"))
            },
        );

        b.method(
            "DisplayPasskey",
            ("device", "passkey", "entered"),
            (),
            move |_ctx, _data, (device, passkey, entered): (Path<'static>, u32, u16)| {
                log::info!("DisplayPasskey({}, {}, entered={})", device, passkey, entered);
                Ok(())
            },
        );

        b.method(
            "RequestConfirmation",
            ("device", "passkey"),
            (),
            move |_ctx, data: &mut Arc<AgentData>, (device, passkey): (Path<'static>, u32)| {
                let accept = device_address_of(&device)
                    .map(|addr| data.delegate.read().unwrap().request_confirmation(addr, passkey))
                    .unwrap_or(true);
                if accept {
                    Ok(())
                } else {
                    Err(dbus::MethodErr::failed("confirmation rejected"))
                }
            },
        );

        b.method(
            "RequestAuthorization",
            ("device",),
            (),
            move |_ctx, data: &mut Arc<AgentData>, (device,): (Path<'static>,)| {
                if let Some(addr) = device_address_of(&device) {
                    data.delegate.read().unwrap().on_authorization_requested(addr);
                }
                Ok(())
            },
        );

        b.method(
            "AuthorizeService",
            ("device", "uuid"),
            (),
            move |_ctx, _data, (device, uuid): (Path<'static>, String)| {
                log::debug!("AuthorizeService({}, {})", device, uuid);
                Ok(())
            },
        );

        b.method("Cancel", (), (), move |_ctx, _data, ()| Ok(()));
        b.method("Release", (), (), move |_ctx, _data, ()| Ok(()));
    })
}

static_assertions::assert_impl_all!(PairingAgent: Send);
