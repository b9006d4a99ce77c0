//! Message-bus seam.
//!
//! The driver talks to the Bluetooth daemon over an asynchronous message
//! bus that delivers method calls, replies and signals in order. The bus
//! transport itself is an external collaborator; this module defines the
//! typed surface the registry and negotiator consume, plus a [`MockBus`]
//! double used by the tests.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Serial number correlating an outbound call with its asynchronous reply.
pub type Serial = u64;

/// Bus interfaces the driver speaks or listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    /// `org.bluez.Manager` — adapter enumeration.
    Manager,
    /// `org.bluez.Adapter` — per-radio object.
    Adapter,
    /// `org.bluez.Device` — remote peer object.
    Device,
    /// `org.bluez.Audio` — umbrella audio interface.
    Audio,
    /// `org.bluez.Headset` — HSP/HFP headset role.
    Headset,
    /// `org.bluez.AudioSink` — remote A2DP sink.
    AudioSink,
    /// `org.bluez.AudioSource` — remote A2DP source.
    AudioSource,
    /// `org.bluez.HandsfreeGateway` — HFP gateway role.
    HandsfreeGateway,
    /// `org.bluez.MediaEndpoint` — our local endpoint objects.
    MediaEndpoint,
    /// `org.bluez.MediaTransport` — negotiated stream object.
    MediaTransport,
    /// `org.bluez.Media` — endpoint registration on an adapter.
    Media,
    /// `org.freedesktop.DBus` — bus bookkeeping (name ownership).
    DBus,
}

impl Interface {
    /// Wire name of the interface.
    pub fn name(self) -> &'static str {
        match self {
            Interface::Manager => "org.bluez.Manager",
            Interface::Adapter => "org.bluez.Adapter",
            Interface::Device => "org.bluez.Device",
            Interface::Audio => "org.bluez.Audio",
            Interface::Headset => "org.bluez.Headset",
            Interface::AudioSink => "org.bluez.AudioSink",
            Interface::AudioSource => "org.bluez.AudioSource",
            Interface::HandsfreeGateway => "org.bluez.HandsfreeGateway",
            Interface::MediaEndpoint => "org.bluez.MediaEndpoint",
            Interface::MediaTransport => "org.bluez.MediaTransport",
            Interface::Media => "org.bluez.Media",
            Interface::DBus => "org.freedesktop.DBus",
        }
    }

    /// Parse a wire interface name. Unknown interfaces yield `None` and the
    /// caller is expected to ignore the message.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "org.bluez.Manager" => Interface::Manager,
            "org.bluez.Adapter" => Interface::Adapter,
            "org.bluez.Device" => Interface::Device,
            "org.bluez.Audio" => Interface::Audio,
            "org.bluez.Headset" => Interface::Headset,
            "org.bluez.AudioSink" => Interface::AudioSink,
            "org.bluez.AudioSource" => Interface::AudioSource,
            "org.bluez.HandsfreeGateway" => Interface::HandsfreeGateway,
            "org.bluez.MediaEndpoint" => Interface::MediaEndpoint,
            "org.bluez.MediaTransport" => Interface::MediaTransport,
            "org.bluez.Media" => Interface::Media,
            "org.freedesktop.DBus" => Interface::DBus,
            _ => return None,
        })
    }
}

/// A dynamically typed bus value (the variant type of the wire protocol).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    ObjectPath(String),
    Bool(bool),
    Byte(u8),
    U16(u16),
    U32(u32),
    Array(Vec<Value>),
    /// Key/variant pairs, as carried by property dictionaries.
    Dict(Vec<(String, Value)>),
    /// Raw byte blob (codec capabilities and configurations).
    Bytes(Vec<u8>),
    /// A passed file descriptor (transport acquisition).
    Fd(RawFd),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Byte(b) => Some(u32::from(*b)),
            Value::U16(v) => Some(u32::from(*v)),
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Outbound method call.
#[derive(Debug, Clone)]
pub struct MethodCall {
    /// Bus name of the destination (the daemon, or a transport's owner).
    pub destination: String,
    /// Object path the call targets.
    pub path: String,
    pub interface: Interface,
    pub member: &'static str,
    pub args: Vec<Value>,
}

/// Inbound method call served by one of our endpoint objects.
#[derive(Debug, Clone)]
pub struct InboundCall {
    /// Bus name of the caller.
    pub sender: String,
    /// Local object path the call was addressed to.
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
}

/// Reply to an inbound method call.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodReturn {
    Ok(Vec<Value>),
    Fault { name: &'static str, message: String },
}

/// Asynchronous reply to one of our outbound calls.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Vec<Value>),
    Err { name: String, message: String },
}

impl Reply {
    /// True when the reply signals that the remote daemon vanished.
    pub fn is_peer_unavailable(&self) -> bool {
        matches!(self, Reply::Err { name, .. } if name == crate::error::FAULT_SERVICE_UNKNOWN)
    }
}

/// Inbound signal.
#[derive(Debug, Clone)]
pub struct Signal {
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
}

/// Outbound half of the bus connection.
///
/// `call` is fire-and-forget with the reply delivered later through the
/// registry's reply entry point; `call_blocking` is reserved for the
/// acquire/release round-trips which the control thread performs
/// synchronously (bounded by the bus transport's own timeout).
pub trait BusConnection: Send + Sync {
    /// Issue an asynchronous method call, returning its serial.
    fn call(&self, call: MethodCall) -> Result<Serial>;

    /// Issue a method call and wait for the reply.
    fn call_blocking(&self, call: MethodCall) -> Result<Vec<Value>>;

    /// Our own unique name on the bus.
    fn unique_name(&self) -> String;
}

/// Extract a blocking-call error out of an error reply.
pub fn reply_error(name: &str, message: &str) -> Error {
    if name == crate::error::FAULT_SERVICE_UNKNOWN {
        Error::PeerUnavailable
    } else {
        Error::Bus(format!("{name}: {message}"))
    }
}

/// In-memory bus double: records outbound calls and serves scripted
/// blocking replies.
#[derive(Default)]
pub struct MockBus {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    next_serial: Serial,
    calls: Vec<(Serial, MethodCall)>,
    blocking_replies: VecDeque<Result<Vec<Value>>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All asynchronous calls issued so far, in order.
    pub fn recorded_calls(&self) -> Vec<(Serial, MethodCall)> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls matching an interface/member pair.
    pub fn calls_to(&self, interface: Interface, member: &str) -> Vec<(Serial, MethodCall)> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(_, c)| c.interface == interface && c.member == member)
            .cloned()
            .collect()
    }

    /// Queue the reply for the next blocking call.
    pub fn push_blocking_reply(&self, reply: Result<Vec<Value>>) {
        self.state.lock().unwrap().blocking_replies.push_back(reply);
    }
}

impl BusConnection for MockBus {
    fn call(&self, call: MethodCall) -> Result<Serial> {
        let mut state = self.state.lock().unwrap();
        state.next_serial += 1;
        let serial = state.next_serial;
        state.calls.push((serial, call));
        Ok(serial)
    }

    fn call_blocking(&self, call: MethodCall) -> Result<Vec<Value>> {
        let mut state = self.state.lock().unwrap();
        state.next_serial += 1;
        let serial = state.next_serial;
        state.calls.push((serial, call));
        state
            .blocking_replies
            .pop_front()
            .unwrap_or_else(|| Err(Error::Bus("no scripted reply".into())))
    }

    fn unique_name(&self) -> String {
        ":1.42".into()
    }
}
