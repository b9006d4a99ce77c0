//! Discovery registry: mirrors the Bluetooth daemon's object tree.
//!
//! The registry owns the driver's model of adapters, devices and
//! transports. It is driven entirely by bus traffic: inbound signals and
//! asynchronous replies mutate the model, inbound endpoint method calls
//! negotiate transports, and every observable change fans out through the
//! event bus. A malformed message aborts processing of that message only;
//! the model survives it untouched.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{
    BusConnection, InboundCall, Interface, MethodCall, MethodReturn, Reply, Serial, Signal, Value,
};
use crate::config::DriverConfig;
use crate::device::{AudioState, Device, Validity};
use crate::endpoint::{
    host_capabilities, parse_set_configuration, select_sbc_configuration, select_sco_configuration,
    ENDPOINT_INTROSPECT_XML,
};
use crate::error::{
    Error, ProtocolError, Result, StreamError, FAULT_INVALID_ARGUMENTS, FAULT_NOT_SUPPORTED,
};
use crate::events::{DriverEvent, EventBus};
use crate::profile::{interface_for_uuid, is_audio_uuid, Profile, PROFILES};
use crate::sbc::{SbcCapabilities, SbcParams};
use crate::transport::{AcquiredTransport, Transport, TransportState, GAIN_MAX};

/// Well-known bus name of the Bluetooth daemon.
pub const SERVICE_NAME: &str = "org.bluez";

/// Context for an outstanding asynchronous call, keyed by serial.
#[derive(Debug)]
enum Pending {
    ListAdapters,
    AdapterProperties,
    DeviceProperties { device: String },
    InterfaceProperties { device: String, interface: Interface },
    RegisterEndpoint { adapter: String, profile: Profile },
    SetProperty,
}

type SignalHandler = fn(&mut Inner, &Signal) -> std::result::Result<(), ProtocolError>;

/// Signal routing table: one handler per (interface, member) pair.
const SIGNAL_DISPATCH: &[(Interface, &str, SignalHandler)] = &[
    (Interface::Manager, "AdapterAdded", Inner::on_adapter_added),
    (Interface::Adapter, "DeviceCreated", Inner::on_device_created),
    (Interface::Adapter, "DeviceRemoved", Inner::on_device_removed),
    (Interface::Device, "PropertyChanged", Inner::on_device_property_changed),
    (Interface::Audio, "PropertyChanged", Inner::on_audio_property_changed),
    (Interface::AudioSink, "PropertyChanged", Inner::on_audio_property_changed),
    (Interface::AudioSource, "PropertyChanged", Inner::on_audio_property_changed),
    (Interface::Headset, "PropertyChanged", Inner::on_audio_property_changed),
    (Interface::HandsfreeGateway, "PropertyChanged", Inner::on_audio_property_changed),
    (Interface::MediaTransport, "PropertyChanged", Inner::on_transport_property_changed),
    (Interface::DBus, "NameOwnerChanged", Inner::on_name_owner_changed),
];

/// Handle to the shared registry. Clones share state; when the last
/// handle drops, every tracked transport and device is torn down with the
/// usual lifecycle events.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

struct Inner {
    bus: Arc<dyn BusConnection>,
    config: DriverConfig,
    devices: HashMap<String, Device>,
    transports: HashMap<String, Transport>,
    pending: HashMap<Serial, Pending>,
    /// Set once the initial adapter listing has been processed; gates
    /// adapter-added signals so listed adapters are not registered twice.
    listing_done: bool,
    events: EventBus,
}

impl Registry {
    /// Connect the registry to a bus and kick off adapter discovery.
    pub fn start(bus: Arc<dyn BusConnection>, config: DriverConfig) -> Result<Registry> {
        let mut inner = Inner {
            bus,
            config,
            devices: HashMap::new(),
            transports: HashMap::new(),
            pending: HashMap::new(),
            listing_done: false,
            events: EventBus::new(),
        };
        inner.begin_listing()?;
        Ok(Registry {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<DriverEvent> {
        self.inner.lock().unwrap().events.subscribe()
    }

    /// Feed an inbound signal into the registry.
    pub fn handle_signal(&self, signal: &Signal) {
        let mut inner = self.inner.lock().unwrap();
        inner.dispatch_signal(signal);
    }

    /// Feed the reply to one of our asynchronous calls into the registry.
    pub fn handle_reply(&self, serial: Serial, reply: &Reply) {
        let mut inner = self.inner.lock().unwrap();
        inner.handle_reply(serial, reply);
    }

    /// Serve a method call addressed to one of our endpoint objects.
    pub fn handle_method_call(&self, call: &InboundCall) -> MethodReturn {
        let mut inner = self.inner.lock().unwrap();
        inner.handle_method_call(call)
    }

    /// Look up a resolved device by object path.
    pub fn find_device_by_path(&self, path: &str) -> Option<Device> {
        let inner = self.inner.lock().unwrap();
        inner
            .devices
            .get(path)
            .filter(|d| d.validity == Validity::Valid && !d.dead)
            .cloned()
    }

    /// Look up a resolved device by hardware address.
    pub fn find_device_by_address(&self, address: &str) -> Option<Device> {
        let inner = self.inner.lock().unwrap();
        inner
            .devices
            .values()
            .find(|d| {
                d.validity == Validity::Valid
                    && !d.dead
                    && d.address.as_deref() == Some(address)
            })
            .cloned()
    }

    /// Whether the device currently has any usable audio connection.
    pub fn any_audio_connected(&self, device_path: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.connection_predicate(device_path)
    }

    pub fn transport(&self, path: &str) -> Option<Transport> {
        self.inner.lock().unwrap().transports.get(path).cloned()
    }

    /// Acquire the transport's stream socket from its owner. With
    /// `optional` set the call is only attempted while the transport is
    /// already `Playing`.
    pub fn acquire_transport(&self, path: &str, optional: bool) -> Result<AcquiredTransport> {
        let (bus, owner, state) = {
            let inner = self.inner.lock().unwrap();
            let t = inner
                .transports
                .get(path)
                .ok_or_else(|| Error::NotFound(path.to_owned()))?;
            (inner.bus.clone(), t.owner.clone(), t.state)
        };
        if optional && state != TransportState::Playing {
            return Err(StreamError::NotAcquired.into());
        }

        let args = bus.call_blocking(MethodCall {
            destination: owner,
            path: path.to_owned(),
            interface: Interface::MediaTransport,
            member: "Acquire",
            args: vec![Value::Str("rw".into())],
        })?;

        let fd = match args.first() {
            Some(Value::Fd(fd)) => *fd,
            _ => return Err(ProtocolError::UnexpectedType("fd").into()),
        };
        let read_mtu = args
            .get(1)
            .and_then(Value::as_u32)
            .ok_or(ProtocolError::UnexpectedType("read MTU"))? as u16;
        let write_mtu = args
            .get(2)
            .and_then(Value::as_u32)
            .ok_or(ProtocolError::UnexpectedType("write MTU"))? as u16;

        Ok(AcquiredTransport {
            fd,
            read_mtu,
            write_mtu,
        })
    }

    /// Hand the stream socket back to the transport's owner.
    pub fn release_transport(&self, path: &str) -> Result<()> {
        let (bus, owner) = {
            let inner = self.inner.lock().unwrap();
            let t = inner
                .transports
                .get(path)
                .ok_or_else(|| Error::NotFound(path.to_owned()))?;
            (inner.bus.clone(), t.owner.clone())
        };
        bus.call_blocking(MethodCall {
            destination: owner,
            path: path.to_owned(),
            interface: Interface::MediaTransport,
            member: "Release",
            args: vec![Value::Str("rw".into())],
        })?;
        Ok(())
    }

    /// Push a microphone gain value to an HSP peer. Values are clamped to
    /// the protocol maximum.
    pub fn set_microphone_gain(&self, transport_path: &str, gain: u16) -> Result<()> {
        self.set_gain(transport_path, "MicrophoneGain", gain)
    }

    /// Push a speaker gain value to an HSP peer.
    pub fn set_speaker_gain(&self, transport_path: &str, gain: u16) -> Result<()> {
        self.set_gain(transport_path, "SpeakerGain", gain)
    }

    fn set_gain(&self, transport_path: &str, property: &'static str, gain: u16) -> Result<()> {
        let gain = gain.min(GAIN_MAX);
        let mut inner = self.inner.lock().unwrap();
        let device_path = {
            let t = inner
                .transports
                .get_mut(transport_path)
                .ok_or_else(|| Error::NotFound(transport_path.to_owned()))?;
            if property == "MicrophoneGain" {
                t.microphone_gain = gain;
            } else {
                t.speaker_gain = gain;
            }
            t.device_path.clone()
        };
        inner.send(
            MethodCall {
                destination: SERVICE_NAME.into(),
                path: device_path,
                interface: Interface::Headset,
                member: "SetProperty",
                args: vec![Value::Str(property.into()), Value::U16(gain)],
            },
            Pending::SetProperty,
        );
        Ok(())
    }

    #[cfg(test)]
    fn with_inner<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        f(&self.inner.lock().unwrap())
    }
}

impl Inner {
    fn begin_listing(&mut self) -> Result<()> {
        let serial = self.bus.call(MethodCall {
            destination: SERVICE_NAME.into(),
            path: "/".into(),
            interface: Interface::Manager,
            member: "ListAdapters",
            args: vec![],
        })?;
        self.pending.insert(serial, Pending::ListAdapters);
        Ok(())
    }

    /// Fire-and-forget variant used once the registry is running: a send
    /// failure loses that query but keeps the model consistent.
    fn send(&mut self, call: MethodCall, pending: Pending) {
        match self.bus.call(call) {
            Ok(serial) => {
                self.pending.insert(serial, pending);
            }
            Err(err) => warn!(error = %err, "bus send failed"),
        }
    }

    fn get_properties(&mut self, interface: Interface, path: &str, pending: Pending) {
        self.send(
            MethodCall {
                destination: SERVICE_NAME.into(),
                path: path.to_owned(),
                interface,
                member: "GetProperties",
                args: vec![],
            },
            pending,
        );
    }

    // ---- signals ----

    fn dispatch_signal(&mut self, signal: &Signal) {
        let Some(interface) = Interface::from_name(&signal.interface) else {
            return;
        };
        let handler = SIGNAL_DISPATCH
            .iter()
            .find(|(i, m, _)| *i == interface && *m == signal.member)
            .map(|(_, _, h)| h);
        if let Some(handler) = handler {
            if let Err(err) = handler(self, signal) {
                warn!(
                    interface = signal.interface,
                    member = signal.member,
                    error = %err,
                    "dropping malformed signal"
                );
            }
        }
    }

    fn on_adapter_added(&mut self, signal: &Signal) -> std::result::Result<(), ProtocolError> {
        // Adapters reported before the initial listing completes would be
        // seen again in the listing reply.
        if !self.listing_done {
            return Ok(());
        }
        let path = arg_str(&signal.args, 0, "adapter")?.to_owned();
        self.register_adapter(&path);
        Ok(())
    }

    fn on_device_created(&mut self, signal: &Signal) -> std::result::Result<(), ProtocolError> {
        let path = arg_str(&signal.args, 0, "device")?.to_owned();
        self.ensure_device(&path);
        Ok(())
    }

    fn on_device_removed(&mut self, signal: &Signal) -> std::result::Result<(), ProtocolError> {
        let path = arg_str(&signal.args, 0, "device")?.to_owned();
        self.remove_device(&path);
        Ok(())
    }

    fn on_device_property_changed(
        &mut self,
        signal: &Signal,
    ) -> std::result::Result<(), ProtocolError> {
        if !self.devices.contains_key(&signal.path) {
            return Ok(());
        }
        let name = arg_str(&signal.args, 0, "property name")?.to_owned();
        let value = signal
            .args
            .get(1)
            .ok_or(ProtocolError::MissingField("property value"))?
            .clone();
        let path = signal.path.clone();
        self.apply_device_property(&path, &name, &value)
    }

    fn on_audio_property_changed(
        &mut self,
        signal: &Signal,
    ) -> std::result::Result<(), ProtocolError> {
        let Some(interface) = Interface::from_name(&signal.interface) else {
            return Ok(());
        };
        if !self.devices.contains_key(&signal.path) {
            return Ok(());
        }
        let name = arg_str(&signal.args, 0, "property name")?.to_owned();
        let value = signal
            .args
            .get(1)
            .ok_or(ProtocolError::MissingField("property value"))?
            .clone();
        let path = signal.path.clone();
        self.apply_audio_property(&path, interface, &name, &value)
    }

    fn on_transport_property_changed(
        &mut self,
        signal: &Signal,
    ) -> std::result::Result<(), ProtocolError> {
        let name = arg_str(&signal.args, 0, "property name")?;
        if name != "NREC" {
            return Ok(());
        }
        let nrec = signal
            .args
            .get(1)
            .and_then(Value::as_bool)
            .ok_or(ProtocolError::UnexpectedType("NREC"))?;
        if let Some(t) = self.transports.get_mut(&signal.path) {
            if t.nrec != nrec {
                t.nrec = nrec;
                let path = signal.path.clone();
                self.events
                    .emit(DriverEvent::TransportNrecChanged { path, nrec });
            }
        }
        Ok(())
    }

    fn on_name_owner_changed(
        &mut self,
        signal: &Signal,
    ) -> std::result::Result<(), ProtocolError> {
        let name = arg_str(&signal.args, 0, "name")?;
        if name != SERVICE_NAME {
            return Ok(());
        }
        let old_owner = arg_str(&signal.args, 1, "old owner")?;
        let new_owner = arg_str(&signal.args, 2, "new owner")?;
        if !old_owner.is_empty() {
            debug!("daemon left the bus");
            self.daemon_gone();
        }
        if !new_owner.is_empty() {
            debug!(owner = new_owner, "daemon appeared on the bus");
            if let Err(err) = self.begin_listing() {
                warn!(error = %err, "adapter listing failed");
            }
        }
        Ok(())
    }

    // ---- replies ----

    fn handle_reply(&mut self, serial: Serial, reply: &Reply) {
        let Some(pending) = self.pending.remove(&serial) else {
            return;
        };
        if reply.is_peer_unavailable() {
            debug!("daemon vanished mid-call");
            self.daemon_gone();
            return;
        }
        match pending {
            Pending::ListAdapters => self.on_list_adapters_reply(reply),
            Pending::AdapterProperties => self.on_adapter_properties_reply(reply),
            Pending::DeviceProperties { device } => {
                self.on_device_properties_reply(&device, reply)
            }
            Pending::InterfaceProperties { device, interface } => {
                self.on_interface_properties_reply(&device, interface, reply)
            }
            Pending::RegisterEndpoint { adapter, profile } => {
                if let Reply::Err { name, message } = reply {
                    // The daemon may legitimately refuse a profile (e.g.
                    // HFP handled by another component).
                    warn!(adapter, ?profile, name, message, "endpoint registration refused");
                }
            }
            Pending::SetProperty => {
                if let Reply::Err { name, message } = reply {
                    warn!(name, message, "property write refused");
                }
            }
        }
    }

    fn on_list_adapters_reply(&mut self, reply: &Reply) {
        let adapters: Vec<String> = match reply {
            Reply::Ok(args) => match args.first() {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect(),
                _ => {
                    warn!("malformed adapter listing");
                    return;
                }
            },
            Reply::Err { name, message } => {
                warn!(name, message, "adapter listing failed");
                return;
            }
        };
        for adapter in &adapters {
            self.register_adapter(adapter);
        }
        self.listing_done = true;
    }

    fn on_adapter_properties_reply(&mut self, reply: &Reply) {
        let Reply::Ok(args) = reply else {
            return;
        };
        let Some(props) = args.first().and_then(Value::as_dict) else {
            warn!("malformed adapter properties");
            return;
        };
        let devices: Vec<String> = props
            .iter()
            .find(|(k, _)| k == "Devices")
            .and_then(|(_, v)| match v {
                Value::Array(items) => Some(
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect(),
                ),
                _ => None,
            })
            .unwrap_or_default();
        for device in devices {
            self.ensure_device(&device);
        }
    }

    fn on_device_properties_reply(&mut self, device_path: &str, reply: &Reply) {
        let props = match reply {
            Reply::Ok(args) => match args.first().and_then(Value::as_dict) {
                Some(props) => props.to_vec(),
                None => {
                    warn!(device = device_path, "malformed device properties");
                    self.invalidate_device(device_path);
                    return;
                }
            },
            Reply::Err { name, message } => {
                warn!(device = device_path, name, message, "device resolution failed");
                self.invalidate_device(device_path);
                return;
            }
        };

        for (name, value) in &props {
            if let Err(err) = self.apply_device_property(device_path, name, value) {
                warn!(device = device_path, error = %err, "dropping device property update");
                return;
            }
        }

        // A configured address filter hides every other device.
        let resolved = self
            .devices
            .get(device_path)
            .is_some_and(|d| match (&d.address, &self.config.address_filter) {
                (Some(address), Some(filter)) => address.eq_ignore_ascii_case(filter),
                (Some(_), None) => true,
                (None, _) => false,
            });
        if let Some(d) = self.devices.get_mut(device_path) {
            d.validity = if resolved {
                Validity::Valid
            } else {
                Validity::Invalid
            };
        }
        self.recompute_connection(device_path);
    }

    fn on_interface_properties_reply(
        &mut self,
        device_path: &str,
        interface: Interface,
        reply: &Reply,
    ) {
        let Reply::Ok(args) = reply else {
            return;
        };
        let Some(props) = args.first().and_then(Value::as_dict) else {
            warn!(device = device_path, "malformed interface properties");
            return;
        };
        for (name, value) in props.to_vec() {
            if let Err(err) = self.apply_audio_property(device_path, interface, &name, &value) {
                warn!(device = device_path, error = %err, "dropping audio property update");
                return;
            }
        }
    }

    // ---- model updates ----

    fn register_adapter(&mut self, adapter: &str) {
        let mut profiles: Vec<Profile> = Vec::new();
        if self.config.enable_a2dp {
            profiles.extend([Profile::A2dpSink, Profile::A2dpSource]);
        }
        if self.config.enable_hsp {
            profiles.extend([Profile::Hsp, Profile::HfGateway]);
        }
        for profile in profiles {
            let properties = Value::Dict(vec![
                ("UUID".into(), Value::Str(profile.remote_uuid().into())),
                ("Codec".into(), Value::Byte(0)),
                (
                    "Capabilities".into(),
                    Value::Bytes(host_capabilities(profile)),
                ),
            ]);
            self.send(
                MethodCall {
                    destination: SERVICE_NAME.into(),
                    path: adapter.to_owned(),
                    interface: Interface::Media,
                    member: "RegisterEndpoint",
                    args: vec![
                        Value::ObjectPath(profile.endpoint_path().into()),
                        properties,
                    ],
                },
                Pending::RegisterEndpoint {
                    adapter: adapter.to_owned(),
                    profile,
                },
            );
        }
        self.get_properties(Interface::Adapter, adapter, Pending::AdapterProperties);
    }

    /// Track a device path, querying its properties if previously unseen.
    fn ensure_device(&mut self, path: &str) {
        if self.devices.contains_key(path) {
            return;
        }
        self.devices.insert(path.to_owned(), Device::new(path.to_owned()));
        self.get_properties(
            Interface::Device,
            path,
            Pending::DeviceProperties {
                device: path.to_owned(),
            },
        );
    }

    fn invalidate_device(&mut self, path: &str) {
        if let Some(d) = self.devices.get_mut(path) {
            d.validity = Validity::Invalid;
        }
    }

    fn apply_device_property(
        &mut self,
        device_path: &str,
        name: &str,
        value: &Value,
    ) -> std::result::Result<(), ProtocolError> {
        match name {
            "Address" => {
                let address = value
                    .as_str()
                    .ok_or(ProtocolError::UnexpectedType("Address"))?
                    .to_owned();
                if let Some(d) = self.devices.get_mut(device_path) {
                    d.set_address(&address)?;
                }
            }
            "Name" => {
                let v = value.as_str().ok_or(ProtocolError::UnexpectedType("Name"))?;
                if let Some(d) = self.devices.get_mut(device_path) {
                    d.name = Some(v.to_owned());
                }
            }
            "Alias" => {
                let v = value.as_str().ok_or(ProtocolError::UnexpectedType("Alias"))?;
                if let Some(d) = self.devices.get_mut(device_path) {
                    d.alias = Some(v.to_owned());
                }
            }
            "Class" => {
                let v = value.as_u32().ok_or(ProtocolError::UnexpectedType("Class"))?;
                if let Some(d) = self.devices.get_mut(device_path) {
                    d.class = Some(v);
                }
            }
            "Paired" => {
                let v = value.as_bool().ok_or(ProtocolError::UnexpectedType("Paired"))?;
                if let Some(d) = self.devices.get_mut(device_path) {
                    d.paired = v.into();
                }
            }
            "Trusted" => {
                let v = value.as_bool().ok_or(ProtocolError::UnexpectedType("Trusted"))?;
                if let Some(d) = self.devices.get_mut(device_path) {
                    d.trusted = v.into();
                }
            }
            "UUIDs" => {
                let items = match value {
                    Value::Array(items) => items,
                    _ => return Err(ProtocolError::UnexpectedType("UUIDs")),
                };
                let strings: Vec<String> = items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect();
                self.process_uuids(device_path, &strings);
            }
            _ => {}
        }
        Ok(())
    }

    /// Merge a UUID listing into the device. Each genuinely new UUID
    /// fires an event; the first UUID implying a given audio interface
    /// triggers one capability query on it, and the first audio UUID of
    /// any kind triggers one query on the umbrella audio interface.
    fn process_uuids(&mut self, device_path: &str, uuid_strings: &[String]) {
        let (new_uuids, queries, query_umbrella) = {
            let Some(device) = self.devices.get_mut(device_path) else {
                return;
            };
            let had_audio = device.uuids().iter().any(is_audio_uuid);

            let mut new_uuids: Vec<Uuid> = Vec::new();
            for s in uuid_strings {
                match Uuid::parse_str(s) {
                    Ok(u) => {
                        if device.add_uuid(u) {
                            new_uuids.push(u);
                        }
                    }
                    Err(_) => warn!(device = device_path, uuid = %s, "unparseable UUID"),
                }
            }

            let old_interfaces: HashSet<Interface> = device
                .uuids()
                .iter()
                .filter(|u| !new_uuids.contains(u))
                .filter_map(interface_for_uuid)
                .collect();
            let mut seen: HashSet<Interface> = HashSet::new();
            let mut queries: Vec<Interface> = Vec::new();
            for u in &new_uuids {
                if let Some(iface) = interface_for_uuid(u) {
                    if !old_interfaces.contains(&iface) && seen.insert(iface) {
                        queries.push(iface);
                    }
                }
            }
            let now_audio = device.uuids().iter().any(is_audio_uuid);
            (new_uuids, queries, !had_audio && now_audio)
        };

        for uuid in new_uuids {
            self.events.emit(DriverEvent::DeviceUuidAdded {
                path: device_path.to_owned(),
                uuid,
            });
        }
        for interface in queries {
            self.get_properties(
                interface,
                device_path,
                Pending::InterfaceProperties {
                    device: device_path.to_owned(),
                    interface,
                },
            );
        }
        if query_umbrella {
            self.get_properties(
                Interface::Audio,
                device_path,
                Pending::InterfaceProperties {
                    device: device_path.to_owned(),
                    interface: Interface::Audio,
                },
            );
        }
    }

    fn apply_audio_property(
        &mut self,
        device_path: &str,
        interface: Interface,
        name: &str,
        value: &Value,
    ) -> std::result::Result<(), ProtocolError> {
        match name {
            "State" => {
                let state = AudioState::from_bus_str(
                    value.as_str().ok_or(ProtocolError::UnexpectedType("State"))?,
                );
                self.apply_audio_state(device_path, interface, state);
            }
            "SpeakerGain" | "MicrophoneGain" if interface == Interface::Headset => {
                let gain = value
                    .as_u32()
                    .ok_or(ProtocolError::UnexpectedType("gain"))?
                    .min(u32::from(GAIN_MAX)) as u16;
                self.apply_gain(device_path, name, gain);
            }
            _ => {}
        }
        Ok(())
    }

    fn apply_audio_state(&mut self, device_path: &str, interface: Interface, state: AudioState) {
        let mut transport_updates: Vec<(String, TransportState)> = Vec::new();
        {
            let Some(device) = self.devices.get_mut(device_path) else {
                return;
            };
            if interface == Interface::Audio {
                device.audio_state = state;
            } else if let Some(profile) =
                PROFILES.iter().copied().find(|p| p.interface() == interface)
            {
                device.profile_states[profile.index()] = state;
                if let Some(tpath) = device.transport_for(profile) {
                    transport_updates.push((tpath.to_owned(), TransportState::from_audio_state(state)));
                }
            }
        }
        for (tpath, new_state) in transport_updates {
            self.set_transport_state(&tpath, new_state);
        }
        self.recompute_connection(device_path);
    }

    fn set_transport_state(&mut self, path: &str, state: TransportState) {
        let changed = match self.transports.get_mut(path) {
            Some(t) if t.state != state => {
                t.state = state;
                true
            }
            _ => false,
        };
        if changed {
            self.events.emit(DriverEvent::TransportStateChanged {
                path: path.to_owned(),
                state,
            });
        }
    }

    fn apply_gain(&mut self, device_path: &str, property: &str, gain: u16) {
        let Some(tpath) = self
            .devices
            .get(device_path)
            .and_then(|d| d.transport_for(Profile::Hsp))
            .map(str::to_owned)
        else {
            return;
        };
        let Some(t) = self.transports.get_mut(&tpath) else {
            return;
        };
        let event = if property == "MicrophoneGain" {
            if t.microphone_gain == gain {
                return;
            }
            t.microphone_gain = gain;
            DriverEvent::TransportMicrophoneGainChanged { path: tpath, gain }
        } else {
            if t.speaker_gain == gain {
                return;
            }
            t.speaker_gain = gain;
            DriverEvent::TransportSpeakerGainChanged { path: tpath, gain }
        };
        self.events.emit(event);
    }

    /// True when the device is resolved, alive, its umbrella state is not
    /// invalid or still connecting, and at least one transport is usable.
    fn connection_predicate(&self, device_path: &str) -> bool {
        let Some(device) = self.devices.get(device_path) else {
            return false;
        };
        if device.dead || device.validity != Validity::Valid {
            return false;
        }
        if matches!(device.audio_state, AudioState::Invalid | AudioState::Connecting) {
            return false;
        }
        device.bound_transports().any(|(_, tpath)| {
            self.transports
                .get(tpath)
                .is_some_and(|t| t.state.is_connected())
        })
    }

    /// Edge-detect the connection predicate and fire the change event.
    fn recompute_connection(&mut self, device_path: &str) {
        let connected = self.connection_predicate(device_path);
        let fire = match self.devices.get_mut(device_path) {
            Some(d) if d.validity == Validity::Valid && d.was_connected != connected => {
                d.was_connected = connected;
                true
            }
            _ => false,
        };
        if fire {
            self.events.emit(DriverEvent::DeviceConnectionChanged {
                path: device_path.to_owned(),
                connected,
            });
        }
    }

    /// Destroy a transport: unbind it from its device, force the state to
    /// `Disconnected` and fire the final lifecycle event.
    fn destroy_transport(&mut self, path: &str) {
        let Some(t) = self.transports.remove(path) else {
            return;
        };
        if let Some(d) = self.devices.get_mut(&t.device_path) {
            d.unbind_transport(t.profile);
        }
        self.events.emit(DriverEvent::TransportStateChanged {
            path: path.to_owned(),
            state: TransportState::Disconnected,
        });
        self.recompute_connection(&t.device_path);
    }

    fn remove_device(&mut self, path: &str) {
        let Some(device) = self.devices.get_mut(path) else {
            return;
        };
        device.dead = true;
        let bound: Vec<String> = device
            .bound_transports()
            .map(|(_, t)| t.to_owned())
            .collect();
        let fire_disconnect = device.validity == Validity::Valid && device.was_connected;

        for tpath in bound {
            self.destroy_transport(&tpath);
        }
        if fire_disconnect {
            self.events.emit(DriverEvent::DeviceConnectionChanged {
                path: path.to_owned(),
                connected: false,
            });
        }
        self.devices.remove(path);
    }

    /// The daemon left the bus: every object it published is gone.
    fn daemon_gone(&mut self) {
        self.pending.clear();
        self.listing_done = false;
        let paths: Vec<String> = self.devices.keys().cloned().collect();
        for path in paths {
            self.remove_device(&path);
        }
    }

    // ---- endpoint methods ----

    fn handle_method_call(&mut self, call: &InboundCall) -> MethodReturn {
        if call.member == "Introspect" {
            return MethodReturn::Ok(vec![Value::Str(ENDPOINT_INTROSPECT_XML.into())]);
        }
        let Some(profile) = Profile::from_endpoint_path(&call.path) else {
            return MethodReturn::Fault {
                name: FAULT_INVALID_ARGUMENTS,
                message: format!("unknown endpoint {}", call.path),
            };
        };
        match call.member.as_str() {
            "SelectConfiguration" => self.select_configuration(profile, call),
            "SetConfiguration" => self.set_configuration(profile, call),
            "ClearConfiguration" => self.clear_configuration(call),
            "Release" => MethodReturn::Ok(vec![]),
            other => MethodReturn::Fault {
                name: FAULT_NOT_SUPPORTED,
                message: format!("unknown method {other}"),
            },
        }
    }

    fn select_configuration(&mut self, profile: Profile, call: &InboundCall) -> MethodReturn {
        let Some(caps) = call.args.first().and_then(Value::as_bytes) else {
            return MethodReturn::Fault {
                name: FAULT_INVALID_ARGUMENTS,
                message: "missing capabilities".into(),
            };
        };
        let selected = if profile.uses_rtp() {
            SbcCapabilities::parse(caps).and_then(|caps| {
                select_sbc_configuration(&caps, &self.config.default_spec)
                    .map(|params| params.to_bytes().to_vec())
            })
        } else {
            select_sco_configuration(caps)
        };
        match selected {
            Ok(config) => {
                debug!(?profile, ?config, "configuration selected");
                MethodReturn::Ok(vec![Value::Bytes(config)])
            }
            Err(err) => MethodReturn::Fault {
                name: err.fault_name(),
                message: err.to_string(),
            },
        }
    }

    fn set_configuration(&mut self, profile: Profile, call: &InboundCall) -> MethodReturn {
        let req = match parse_set_configuration(&call.args) {
            Ok(req) => req,
            Err(err) => {
                return MethodReturn::Fault {
                    name: FAULT_INVALID_ARGUMENTS,
                    message: err.to_string(),
                }
            }
        };
        if self.transports.contains_key(&req.transport_path) {
            return MethodReturn::Fault {
                name: FAULT_INVALID_ARGUMENTS,
                message: format!("transport {} is already configured", req.transport_path),
            };
        }
        if profile.uses_rtp() {
            if let Err(err) = SbcParams::from_bytes(&req.configuration) {
                return MethodReturn::Fault {
                    name: err.fault_name(),
                    message: err.to_string(),
                };
            }
        }

        self.ensure_device(&req.device_path);
        let initial_state = {
            let Some(device) = self.devices.get_mut(&req.device_path) else {
                return MethodReturn::Fault {
                    name: FAULT_INVALID_ARGUMENTS,
                    message: format!("unknown device {}", req.device_path),
                };
            };
            if device
                .bind_transport(profile, req.transport_path.clone())
                .is_err()
            {
                return MethodReturn::Fault {
                    name: FAULT_INVALID_ARGUMENTS,
                    message: format!(
                        "device {} already has a transport for this profile",
                        req.device_path
                    ),
                };
            }
            TransportState::from_audio_state(device.profile_states[profile.index()])
        };

        let mut transport = Transport::new(
            req.transport_path.clone(),
            profile,
            req.device_path.clone(),
            call.sender.clone(),
            req.configuration,
        );
        transport.state = initial_state;
        if let Some(nrec) = req.nrec {
            transport.nrec = nrec;
        }
        debug!(path = req.transport_path, ?profile, "transport configured");
        self.transports.insert(req.transport_path.clone(), transport);
        self.events.emit(DriverEvent::TransportStateChanged {
            path: req.transport_path,
            state: initial_state,
        });
        self.recompute_connection(&req.device_path);
        MethodReturn::Ok(vec![])
    }

    fn clear_configuration(&mut self, call: &InboundCall) -> MethodReturn {
        let Some(path) = call.args.first().and_then(Value::as_str) else {
            return MethodReturn::Fault {
                name: FAULT_INVALID_ARGUMENTS,
                message: "missing transport path".into(),
            };
        };
        // Clearing an unknown transport is a no-op.
        let path = path.to_owned();
        self.destroy_transport(&path);
        MethodReturn::Ok(vec![])
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let paths: Vec<String> = self.devices.keys().cloned().collect();
        for path in paths {
            self.remove_device(&path);
        }
    }
}

fn arg_str<'a>(
    args: &'a [Value],
    index: usize,
    what: &'static str,
) -> std::result::Result<&'a str, ProtocolError> {
    args.get(index)
        .ok_or(ProtocolError::MissingField(what))?
        .as_str()
        .ok_or(ProtocolError::UnexpectedType(what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::profile::A2DP_SINK_UUID;

    fn start() -> (Arc<MockBus>, Registry) {
        let bus = Arc::new(MockBus::new());
        let registry = Registry::start(bus.clone(), DriverConfig::default()).unwrap();
        (bus, registry)
    }

    fn signal(interface: Interface, path: &str, member: &str, args: Vec<Value>) -> Signal {
        Signal {
            sender: SERVICE_NAME.into(),
            path: path.into(),
            interface: interface.name().into(),
            member: member.into(),
            args,
        }
    }

    /// Walk the registry through adapter listing and device creation.
    fn seed_device(bus: &MockBus, registry: &Registry, device: &str) {
        let (serial, _) = bus.calls_to(Interface::Manager, "ListAdapters")[0];
        registry.handle_reply(
            serial,
            &Reply::Ok(vec![Value::Array(vec![Value::ObjectPath(
                "/org/bluez/hci0".into(),
            )])]),
        );
        registry.handle_signal(&signal(
            Interface::Adapter,
            "/org/bluez/hci0",
            "DeviceCreated",
            vec![Value::ObjectPath(device.into())],
        ));
    }

    fn resolve_device(bus: &MockBus, registry: &Registry, uuids: Vec<&str>) {
        let (serial, _) = *bus
            .calls_to(Interface::Device, "GetProperties")
            .last()
            .unwrap();
        let uuid_values = uuids.into_iter().map(|u| Value::Str(u.into())).collect();
        registry.handle_reply(
            serial,
            &Reply::Ok(vec![Value::Dict(vec![
                ("Address".into(), Value::Str("00:11:22:33:44:55".into())),
                ("Name".into(), Value::Str("Headphones".into())),
                ("UUIDs".into(), Value::Array(uuid_values)),
            ])]),
        );
    }

    fn inbound(path: &str, member: &str, args: Vec<Value>) -> InboundCall {
        InboundCall {
            sender: ":1.3".into(),
            path: path.into(),
            interface: Interface::MediaEndpoint.name().into(),
            member: member.into(),
            args,
        }
    }

    /// A valid A2DP sink SetConfiguration call for the test device.
    fn set_configuration_call(transport: &str) -> InboundCall {
        let caps =
            SbcCapabilities::parse(&host_capabilities(Profile::A2dpSink)).unwrap();
        let selected =
            select_sbc_configuration(&caps, &crate::config::SampleSpec::default()).unwrap();
        inbound(
            Profile::A2dpSink.endpoint_path(),
            "SetConfiguration",
            vec![
                Value::ObjectPath(transport.into()),
                Value::Dict(vec![
                    ("Device".into(), Value::ObjectPath(DEV.into())),
                    (
                        "Configuration".into(),
                        Value::Bytes(selected.to_bytes().to_vec()),
                    ),
                ]),
            ],
        )
    }

    const DEV: &str = "/org/bluez/hci0/dev_00_11_22_33_44_55";

    #[test]
    fn startup_lists_adapters() {
        let (bus, _registry) = start();
        assert_eq!(bus.calls_to(Interface::Manager, "ListAdapters").len(), 1);
    }

    #[test]
    fn adapter_listing_registers_endpoints_and_queries_devices() {
        let (bus, registry) = start();
        let (serial, _) = bus.calls_to(Interface::Manager, "ListAdapters")[0];
        registry.handle_reply(
            serial,
            &Reply::Ok(vec![Value::Array(vec![Value::ObjectPath(
                "/org/bluez/hci0".into(),
            )])]),
        );
        // Four profiles registered, plus the adapter property query.
        assert_eq!(bus.calls_to(Interface::Media, "RegisterEndpoint").len(), 4);
        assert_eq!(bus.calls_to(Interface::Adapter, "GetProperties").len(), 1);
        assert!(registry.with_inner(|i| i.listing_done));
    }

    #[test]
    fn hsp_can_be_disabled() {
        let bus = Arc::new(MockBus::new());
        let config = DriverConfig {
            enable_hsp: false,
            ..DriverConfig::default()
        };
        let registry = Registry::start(bus.clone(), config).unwrap();
        let (serial, _) = bus.calls_to(Interface::Manager, "ListAdapters")[0];
        registry.handle_reply(
            serial,
            &Reply::Ok(vec![Value::Array(vec![Value::ObjectPath(
                "/org/bluez/hci0".into(),
            )])]),
        );
        assert_eq!(bus.calls_to(Interface::Media, "RegisterEndpoint").len(), 2);
    }

    #[test]
    fn adapter_added_is_ignored_until_listing_completes() {
        let (bus, registry) = start();
        registry.handle_signal(&signal(
            Interface::Manager,
            "/",
            "AdapterAdded",
            vec![Value::ObjectPath("/org/bluez/hci1".into())],
        ));
        assert!(bus.calls_to(Interface::Media, "RegisterEndpoint").is_empty());
    }

    #[test]
    fn sink_uuid_triggers_one_sink_query_and_one_umbrella_query() {
        let (bus, registry) = start();
        seed_device(&bus, &registry, DEV);
        resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);

        assert_eq!(bus.calls_to(Interface::AudioSink, "GetProperties").len(), 1);
        assert_eq!(bus.calls_to(Interface::Audio, "GetProperties").len(), 1);

        // The same UUID arriving again via a property change is a no-op.
        registry.handle_signal(&signal(
            Interface::Device,
            DEV,
            "PropertyChanged",
            vec![
                Value::Str("UUIDs".into()),
                Value::Array(vec![Value::Str(A2DP_SINK_UUID.into())]),
            ],
        ));
        assert_eq!(bus.calls_to(Interface::AudioSink, "GetProperties").len(), 1);
        assert_eq!(bus.calls_to(Interface::Audio, "GetProperties").len(), 1);
    }

    #[test]
    fn new_uuid_fires_event_and_resolved_device_is_findable() {
        let (bus, registry) = start();
        let events = registry.subscribe();
        seed_device(&bus, &registry, DEV);
        resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);

        assert!(matches!(
            events.try_recv().unwrap(),
            DriverEvent::DeviceUuidAdded { .. }
        ));
        let device = registry.find_device_by_path(DEV).unwrap();
        assert_eq!(device.address.as_deref(), Some("00:11:22:33:44:55"));
        assert!(registry.find_device_by_address("00:11:22:33:44:55").is_some());
        assert!(registry.find_device_by_address("aa:aa:aa:aa:aa:aa").is_none());
    }

    #[test]
    fn address_filter_hides_other_devices() {
        let bus = Arc::new(MockBus::new());
        let config = DriverConfig {
            address_filter: Some("AA:BB:CC:DD:EE:FF".into()),
            ..DriverConfig::default()
        };
        let registry = Registry::start(bus.clone(), config).unwrap();
        seed_device(&bus, &registry, DEV);
        resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);
        assert!(registry.find_device_by_path(DEV).is_none());
    }

    #[test]
    fn address_filter_keeps_the_matching_device() {
        let bus = Arc::new(MockBus::new());
        let config = DriverConfig {
            address_filter: Some("00:11:22:33:44:55".into()),
            ..DriverConfig::default()
        };
        let registry = Registry::start(bus.clone(), config).unwrap();
        seed_device(&bus, &registry, DEV);
        resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);
        assert!(registry.find_device_by_path(DEV).is_some());
    }

    #[test]
    fn failed_device_resolution_hides_the_device() {
        let (bus, registry) = start();
        seed_device(&bus, &registry, DEV);
        let (serial, _) = bus.calls_to(Interface::Device, "GetProperties")[0];
        registry.handle_reply(
            serial,
            &Reply::Err {
                name: "org.bluez.Error.Failed".into(),
                message: "no".into(),
            },
        );
        assert!(registry.find_device_by_path(DEV).is_none());
    }

    #[test]
    fn daemon_disappearance_empties_the_registry_and_resets_listing() {
        let (bus, registry) = start();
        seed_device(&bus, &registry, DEV);
        resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);
        assert!(registry.with_inner(|i| i.listing_done));

        // The pending umbrella query fails because the daemon is gone.
        let (serial, _) = bus.calls_to(Interface::Audio, "GetProperties")[0];
        registry.handle_reply(
            serial,
            &Reply::Err {
                name: crate::error::FAULT_SERVICE_UNKNOWN.into(),
                message: "gone".into(),
            },
        );

        assert!(registry.find_device_by_path(DEV).is_none());
        assert!(!registry.with_inner(|i| i.listing_done));
        assert!(registry.with_inner(|i| i.pending.is_empty()));
    }

    #[test]
    fn daemon_restart_relists_adapters() {
        let (bus, registry) = start();
        registry.handle_signal(&signal(
            Interface::DBus,
            "/org/freedesktop/DBus",
            "NameOwnerChanged",
            vec![
                Value::Str(SERVICE_NAME.into()),
                Value::Str(":1.3".into()),
                Value::Str("".into()),
            ],
        ));
        registry.handle_signal(&signal(
            Interface::DBus,
            "/org/freedesktop/DBus",
            "NameOwnerChanged",
            vec![
                Value::Str(SERVICE_NAME.into()),
                Value::Str("".into()),
                Value::Str(":1.7".into()),
            ],
        ));
        assert_eq!(bus.calls_to(Interface::Manager, "ListAdapters").len(), 2);
    }

    #[test]
    fn malformed_signal_leaves_state_untouched() {
        let (bus, registry) = start();
        seed_device(&bus, &registry, DEV);
        resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);
        // Property change with a wrongly typed value.
        registry.handle_signal(&signal(
            Interface::Device,
            DEV,
            "PropertyChanged",
            vec![Value::Str("Name".into()), Value::Bool(true)],
        ));
        let device = registry.find_device_by_path(DEV).unwrap();
        assert_eq!(device.name.as_deref(), Some("Headphones"));
    }

    mod endpoint_calls {
        use super::*;

        #[test]
        fn select_configuration_returns_a_parseable_blob() {
            let (_bus, registry) = start();
            let caps = crate::endpoint::host_capabilities(Profile::A2dpSink);
            let ret = registry.handle_method_call(&inbound(
                Profile::A2dpSink.endpoint_path(),
                "SelectConfiguration",
                vec![Value::Bytes(caps)],
            ));
            match ret {
                MethodReturn::Ok(values) => {
                    let blob = values[0].as_bytes().unwrap();
                    SbcParams::from_bytes(blob).unwrap();
                }
                other => panic!("unexpected return {other:?}"),
            }
        }

        #[test]
        fn select_configuration_rejects_bad_capabilities() {
            let (_bus, registry) = start();
            let ret = registry.handle_method_call(&inbound(
                Profile::A2dpSink.endpoint_path(),
                "SelectConfiguration",
                vec![Value::Bytes(vec![1, 2])],
            ));
            assert!(matches!(ret, MethodReturn::Fault { .. }));
        }

        #[test]
        fn set_configuration_creates_a_bound_transport() {
            let (bus, registry) = start();
            seed_device(&bus, &registry, DEV);
            resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);

            let ret = registry.handle_method_call(&set_configuration_call("/t0"));
            assert_eq!(ret, MethodReturn::Ok(vec![]));

            let transport = registry.transport("/t0").unwrap();
            assert_eq!(transport.profile, Profile::A2dpSink);
            assert_eq!(transport.device_path, DEV);
            assert_eq!(transport.owner, ":1.3");
        }

        #[test]
        fn duplicate_transport_path_is_rejected() {
            let (bus, registry) = start();
            seed_device(&bus, &registry, DEV);
            resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);

            registry.handle_method_call(&set_configuration_call("/t0"));
            let ret = registry.handle_method_call(&set_configuration_call("/t0"));
            assert!(matches!(
                ret,
                MethodReturn::Fault {
                    name: FAULT_INVALID_ARGUMENTS,
                    ..
                }
            ));
        }

        #[test]
        fn second_transport_for_same_profile_is_rejected() {
            let (bus, registry) = start();
            seed_device(&bus, &registry, DEV);
            resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);

            registry.handle_method_call(&set_configuration_call("/t0"));
            let ret = registry.handle_method_call(&set_configuration_call("/t1"));
            assert!(matches!(
                ret,
                MethodReturn::Fault {
                    name: FAULT_INVALID_ARGUMENTS,
                    ..
                }
            ));
        }

        #[test]
        fn clear_configuration_is_idempotent_and_fires_disconnect() {
            let (bus, registry) = start();
            seed_device(&bus, &registry, DEV);
            resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);
            registry.handle_method_call(&set_configuration_call("/t0"));
            let events = registry.subscribe();

            let clear = inbound(
                Profile::A2dpSink.endpoint_path(),
                "ClearConfiguration",
                vec![Value::ObjectPath("/t0".into())],
            );
            assert_eq!(registry.handle_method_call(&clear), MethodReturn::Ok(vec![]));
            assert!(registry.transport("/t0").is_none());
            assert!(matches!(
                events.try_recv().unwrap(),
                DriverEvent::TransportStateChanged {
                    state: TransportState::Disconnected,
                    ..
                }
            ));

            // Clearing again is a quiet no-op.
            assert_eq!(registry.handle_method_call(&clear), MethodReturn::Ok(vec![]));
            assert!(events.try_recv().is_err());
        }

        #[test]
        fn introspect_serves_the_endpoint_document() {
            let (_bus, registry) = start();
            let ret = registry.handle_method_call(&inbound(
                Profile::A2dpSink.endpoint_path(),
                "Introspect",
                vec![],
            ));
            match ret {
                MethodReturn::Ok(values) => {
                    assert!(values[0].as_str().unwrap().contains("MediaEndpoint"));
                }
                other => panic!("unexpected return {other:?}"),
            }
        }

        #[test]
        fn unknown_member_is_not_supported() {
            let (_bus, registry) = start();
            let ret = registry.handle_method_call(&inbound(
                Profile::A2dpSink.endpoint_path(),
                "Frobnicate",
                vec![],
            ));
            assert!(matches!(
                ret,
                MethodReturn::Fault {
                    name: FAULT_NOT_SUPPORTED,
                    ..
                }
            ));
        }
    }

    mod connection_tracking {
        use super::*;

        #[test]
        fn profile_state_drives_transport_and_connection_events() {
            let (bus, registry) = start();
            seed_device(&bus, &registry, DEV);
            resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);
            registry.handle_method_call(&set_configuration_call("/t0"));
            let events = registry.subscribe();

            registry.handle_signal(&signal(
                Interface::Audio,
                DEV,
                "PropertyChanged",
                vec![Value::Str("State".into()), Value::Str("connected".into())],
            ));
            registry.handle_signal(&signal(
                Interface::AudioSink,
                DEV,
                "PropertyChanged",
                vec![Value::Str("State".into()), Value::Str("connected".into())],
            ));

            // Transport went Idle, then the device edge fired.
            assert!(matches!(
                events.try_recv().unwrap(),
                DriverEvent::TransportStateChanged {
                    state: TransportState::Idle,
                    ..
                }
            ));
            assert!(matches!(
                events.try_recv().unwrap(),
                DriverEvent::DeviceConnectionChanged {
                    connected: true,
                    ..
                }
            ));
            assert!(registry.any_audio_connected(DEV));

            registry.handle_signal(&signal(
                Interface::AudioSink,
                DEV,
                "PropertyChanged",
                vec![Value::Str("State".into()), Value::Str("playing".into())],
            ));
            assert!(matches!(
                events.try_recv().unwrap(),
                DriverEvent::TransportStateChanged {
                    state: TransportState::Playing,
                    ..
                }
            ));
            // Still connected, no second edge.
            assert!(events.try_recv().is_err());
        }

        #[test]
        fn connecting_umbrella_state_masks_the_connection() {
            let (bus, registry) = start();
            seed_device(&bus, &registry, DEV);
            resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);
            registry.handle_method_call(&set_configuration_call("/t0"));

            registry.handle_signal(&signal(
                Interface::AudioSink,
                DEV,
                "PropertyChanged",
                vec![Value::Str("State".into()), Value::Str("connected".into())],
            ));
            registry.handle_signal(&signal(
                Interface::Audio,
                DEV,
                "PropertyChanged",
                vec![Value::Str("State".into()), Value::Str("connecting".into())],
            ));
            assert!(!registry.any_audio_connected(DEV));
        }

        #[test]
        fn device_removal_tears_down_transports_and_fires_disconnect() {
            let (bus, registry) = start();
            seed_device(&bus, &registry, DEV);
            resolve_device(&bus, &registry, vec![A2DP_SINK_UUID]);
            registry.handle_method_call(&set_configuration_call("/t0"));
            registry.handle_signal(&signal(
                Interface::Audio,
                DEV,
                "PropertyChanged",
                vec![Value::Str("State".into()), Value::Str("connected".into())],
            ));
            registry.handle_signal(&signal(
                Interface::AudioSink,
                DEV,
                "PropertyChanged",
                vec![Value::Str("State".into()), Value::Str("connected".into())],
            ));
            let events = registry.subscribe();

            registry.handle_signal(&signal(
                Interface::Adapter,
                "/org/bluez/hci0",
                "DeviceRemoved",
                vec![Value::ObjectPath(DEV.into())],
            ));

            assert!(matches!(
                events.try_recv().unwrap(),
                DriverEvent::TransportStateChanged {
                    state: TransportState::Disconnected,
                    ..
                }
            ));
            assert!(matches!(
                events.try_recv().unwrap(),
                DriverEvent::DeviceConnectionChanged {
                    connected: false,
                    ..
                }
            ));
            assert!(registry.find_device_by_path(DEV).is_none());
            assert!(registry.transport("/t0").is_none());
        }
    }

    mod hsp_properties {
        use super::*;
        use crate::profile::HSP_HS_UUID;

        fn hsp_setup(bus: &MockBus, registry: &Registry) {
            seed_device(bus, registry, DEV);
            resolve_device(bus, registry, vec![HSP_HS_UUID]);
            let call = InboundCall {
                sender: ":1.3".into(),
                path: Profile::Hsp.endpoint_path().into(),
                interface: Interface::MediaEndpoint.name().into(),
                member: "SetConfiguration".into(),
                args: vec![
                    Value::ObjectPath("/sco0".into()),
                    Value::Dict(vec![
                        ("Device".into(), Value::ObjectPath(DEV.into())),
                        ("Configuration".into(), Value::Bytes(vec![0x00])),
                        ("NREC".into(), Value::Bool(true)),
                    ]),
                ],
            };
            assert_eq!(registry.handle_method_call(&call), MethodReturn::Ok(vec![]));
        }

        #[test]
        fn nrec_arrives_with_the_configuration() {
            let (bus, registry) = start();
            hsp_setup(&bus, &registry);
            assert!(registry.transport("/sco0").unwrap().nrec);
        }

        #[test]
        fn remote_gain_change_updates_transport_and_fires_event() {
            let (bus, registry) = start();
            hsp_setup(&bus, &registry);
            let events = registry.subscribe();

            registry.handle_signal(&signal(
                Interface::Headset,
                DEV,
                "PropertyChanged",
                vec![Value::Str("SpeakerGain".into()), Value::U16(9)],
            ));
            assert_eq!(registry.transport("/sco0").unwrap().speaker_gain, 9);
            assert!(matches!(
                events.try_recv().unwrap(),
                DriverEvent::TransportSpeakerGainChanged { gain: 9, .. }
            ));

            // Same value again: no event.
            registry.handle_signal(&signal(
                Interface::Headset,
                DEV,
                "PropertyChanged",
                vec![Value::Str("SpeakerGain".into()), Value::U16(9)],
            ));
            assert!(events.try_recv().is_err());
        }

        #[test]
        fn local_gain_write_is_clamped_and_sent() {
            let (bus, registry) = start();
            hsp_setup(&bus, &registry);

            registry.set_microphone_gain("/sco0", 200).unwrap();
            assert_eq!(registry.transport("/sco0").unwrap().microphone_gain, GAIN_MAX);
            let calls = bus.calls_to(Interface::Headset, "SetProperty");
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].1.args[1], Value::U16(GAIN_MAX));
        }

        #[test]
        fn nrec_signal_on_transport_path_fires_event() {
            let (bus, registry) = start();
            hsp_setup(&bus, &registry);
            let events = registry.subscribe();

            registry.handle_signal(&signal(
                Interface::MediaTransport,
                "/sco0",
                "PropertyChanged",
                vec![Value::Str("NREC".into()), Value::Bool(false)],
            ));
            assert!(!registry.transport("/sco0").unwrap().nrec);
            assert!(matches!(
                events.try_recv().unwrap(),
                DriverEvent::TransportNrecChanged { nrec: false, .. }
            ));
        }
    }

    mod acquisition {
        use super::*;

        fn configured(bus: &MockBus, registry: &Registry) {
            seed_device(bus, registry, DEV);
            resolve_device(bus, registry, vec![A2DP_SINK_UUID]);
            registry.handle_method_call(&set_configuration_call("/t0"));
        }

        #[test]
        fn acquire_returns_fd_and_mtus() {
            let (bus, registry) = start();
            configured(&bus, &registry);

            bus.push_blocking_reply(Ok(vec![Value::Fd(7), Value::U16(679), Value::U16(679)]));
            let acquired = registry.acquire_transport("/t0", false).unwrap();
            assert_eq!(acquired.fd, 7);
            assert_eq!(acquired.read_mtu, 679);
            assert_eq!(acquired.write_mtu, 679);

            let calls = bus.calls_to(Interface::MediaTransport, "Acquire");
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].1.destination, ":1.3");
        }

        #[test]
        fn optional_acquire_requires_playing() {
            let (bus, registry) = start();
            configured(&bus, &registry);

            assert!(matches!(
                registry.acquire_transport("/t0", true),
                Err(Error::Stream(StreamError::NotAcquired))
            ));

            registry.handle_signal(&signal(
                Interface::AudioSink,
                DEV,
                "PropertyChanged",
                vec![Value::Str("State".into()), Value::Str("playing".into())],
            ));
            bus.push_blocking_reply(Ok(vec![Value::Fd(3), Value::U16(679), Value::U16(679)]));
            assert!(registry.acquire_transport("/t0", true).is_ok());
        }

        #[test]
        fn acquire_unknown_transport_fails() {
            let (_bus, registry) = start();
            assert!(matches!(
                registry.acquire_transport("/nope", false),
                Err(Error::NotFound(_))
            ));
        }

        #[test]
        fn release_calls_the_owner() {
            let (bus, registry) = start();
            configured(&bus, &registry);
            bus.push_blocking_reply(Ok(vec![]));
            registry.release_transport("/t0").unwrap();
            assert_eq!(bus.calls_to(Interface::MediaTransport, "Release").len(), 1);
        }
    }
}
