//! Bus Facade (§4.2, C1): thin typed wrappers over BlueZ bus objects.
//!
//! A single capability trait/struct stands in for the source's per-interface
//! inheritance hierarchy (§9 design note): every BlueZ object — adapter,
//! device, service, characteristic, descriptor — is addressed through one
//! [`BusObject`] carrying an object path and interface name. No caching, no
//! queueing; all state discipline lives in the components above this layer.

use crate::constants::{BLUEZ_SERVICE, METHOD_CALL_TIMEOUT};
use crate::error::{Error, Result};
use dbus::arg::{AppendAll, Arg, Get, PropMap, ReadAll, RefArg, Variant};
use dbus::blocking::stdintf::org_freedesktop_dbus::{
    ObjectManager, Introspectable, Properties,
};
use dbus::blocking::{Proxy, SyncConnection};
use dbus::Path;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// The process-wide connection to the system bus, shared by every
/// [`BusObject`] (§5 "the bus connection is shared").
pub struct Bus {
    connection: Arc<SyncConnection>,
}

impl Bus {
    pub fn connect() -> Result<Arc<Self>> {
        let connection = SyncConnection::new_system()
            .map_err(|e| Error::with_message(crate::error::ErrorKind::DbusExecutionException, e.to_string()))?;
        Ok(Arc::new(Bus {
            connection: Arc::new(connection),
        }))
    }

    pub fn connection(&self) -> &Arc<SyncConnection> {
        &self.connection
    }

    /// Returns a typed handle for the object at `path` implementing
    /// `interface`.
    pub fn object(&self, path: impl Into<Path<'static>>, interface: &'static str) -> BusObject {
        BusObject {
            connection: self.connection.clone(),
            path: path.into(),
            interface,
        }
    }

    /// `ObjectManager.GetManagedObjects` against the root object, used to
    /// enumerate adapters and already-known devices (§4.6 adapter selection,
    /// §4.3 InterfacesAdded bootstrap).
    pub fn managed_objects(&self) -> Result<HashMap<Path<'static>, HashMap<String, PropMap>>> {
        let proxy = self.connection.with_proxy(BLUEZ_SERVICE, "/", METHOD_CALL_TIMEOUT);
        Ok(proxy.get_managed_objects()?)
    }
}

/// One BlueZ bus object: an object path plus the interface to address it
/// through (§4.2, §9 "single capability trait").
#[derive(Clone)]
pub struct BusObject {
    connection: Arc<SyncConnection>,
    path: Path<'static>,
    interface: &'static str,
}

impl BusObject {
    pub fn path(&self) -> &Path<'static> {
        &self.path
    }

    pub fn interface(&self) -> &'static str {
        self.interface
    }

    fn proxy(&self) -> Proxy<'_, &SyncConnection> {
        self.connection
            .with_proxy(BLUEZ_SERVICE, self.path.clone(), METHOD_CALL_TIMEOUT)
    }

    /// Reads and decodes property `name` on this object's interface (§4.2
    /// `get_typed<T>`).
    pub fn get_typed<T>(&self, name: &str) -> Result<T>
    where
        T: for<'a> Get<'a> + 'static,
    {
        Ok(self.proxy().get(self.interface, name)?)
    }

    /// Reads all properties on this object's interface as a raw variant
    /// map; the only place in the crate where an undecoded `Variant` is
    /// permitted to exist (§9 "isolated to the Bus Facade").
    pub fn get_all(&self) -> Result<PropMap> {
        Ok(self.proxy().get_all(self.interface)?)
    }

    /// Writes property `name`.
    pub fn set_property<T>(&self, name: &str, value: T) -> Result<()>
    where
        T: Arg + RefArg + 'static,
    {
        Ok(self.proxy().set(self.interface, name, value)?)
    }

    /// Calls `method` on this object's interface with typed error mapping
    /// (§4.2, §7 propagation policy).
    pub fn call_method<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: AppendAll,
        R: ReadAll,
    {
        Ok(self.proxy().method_call(self.interface, method, args)?)
    }

    /// Uses introspection to return the set of immediate child node names
    /// under this object's path (§4.2 `list_children`), e.g. the
    /// `service0025`-style children of a device, or the `char0026`-style
    /// children of a service.
    pub fn list_children(&self) -> Result<Vec<String>> {
        let xml: String = self.proxy().introspect()?;
        Ok(parse_child_node_names(&xml))
    }
}

/// Minimal scan for `<node name="...">` entries in an introspection
/// document. BlueZ's generated XML never nests attributes or escapes node
/// names, so a full XML parser is not needed to extract immediate children
/// (§9 "isolated to the Bus Facade").
fn parse_child_node_names(xml: &str) -> Vec<String> {
    const NEEDLE: &str = "<node name=\"";
    let mut names = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(NEEDLE) {
        rest = &rest[start + NEEDLE.len()..];
        if let Some(end) = rest.find('"') {
            let name = &rest[..end];
            if !name.is_empty() {
                names.push(name.to_string());
            }
            rest = &rest[end..];
        } else {
            break;
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_child_node_names_ignoring_self_node() {
        let xml = r#"<?xml version="1.0"?>
<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect"><arg name="xml_data" direction="out" type="s"/></method>
  </interface>
  <node name="service0025"/>
  <node name="service0031"/>
</node>"#;
        assert_eq!(
            parse_child_node_names(xml),
            vec!["service0025".to_string(), "service0031".to_string()]
        );
    }

    #[test]
    fn empty_when_no_children() {
        let xml = r#"<node><interface name="org.bluez.Device1"/></node>"#;
        assert!(parse_child_node_names(xml).is_empty());
    }
}
