//! End-to-end negotiation scenarios over a scripted bus.

use std::sync::Arc;

use btaudio::bus::{InboundCall, Interface, MethodReturn, MockBus, Reply, Signal, Value};
use btaudio::endpoint::{host_capabilities, select_sbc_configuration};
use btaudio::error::FAULT_INVALID_ARGUMENTS;
use btaudio::profile::A2DP_SINK_UUID;
use btaudio::registry::SERVICE_NAME;
use btaudio::sbc::{Allocation, ChannelMode, SbcCapabilities, SbcParams};
use btaudio::{DriverConfig, DriverEvent, Profile, Registry, SampleSpec, TransportState};

const ADAPTER: &str = "/org/bluez/hci0";
const DEV: &str = "/org/bluez/hci0/dev_00_16_94_01_02_03";

fn start_with_host(rate: u32) -> (Arc<MockBus>, Registry) {
    let bus = Arc::new(MockBus::new());
    let config = DriverConfig {
        default_spec: SampleSpec { rate, channels: 2 },
        ..DriverConfig::default()
    };
    let registry = Registry::start(bus.clone(), config).unwrap();
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

fn endpoint_call(profile: Profile, member: &str, args: Vec<Value>) -> InboundCall {
    InboundCall {
        sender: ":1.9".into(),
        path: profile.endpoint_path().into(),
        interface: Interface::MediaEndpoint.name().into(),
        member: member.into(),
        args,
    }
}

/// Drive the registry through adapter listing and full resolution of one
/// A2DP-capable device.
fn discover_device(bus: &MockBus, registry: &Registry) {
    let (serial, _) = bus.calls_to(Interface::Manager, "ListAdapters")[0];
    registry.handle_reply(
        serial,
        &Reply::Ok(vec![Value::Array(vec![Value::ObjectPath(ADAPTER.into())])]),
    );

    let (serial, _) = *bus
        .calls_to(Interface::Adapter, "GetProperties")
        .last()
        .unwrap();
    registry.handle_reply(
        serial,
        &Reply::Ok(vec![Value::Dict(vec![(
            "Devices".into(),
            Value::Array(vec![Value::ObjectPath(DEV.into())]),
        )])]),
    );

    let (serial, _) = *bus
        .calls_to(Interface::Device, "GetProperties")
        .last()
        .unwrap();
    registry.handle_reply(
        serial,
        &Reply::Ok(vec![Value::Dict(vec![
            ("Address".into(), Value::Str("00:16:94:01:02:03".into())),
            ("Name".into(), Value::Str("Test Headphones".into())),
            ("Class".into(), Value::U32(0x0418)),
            (
                "UUIDs".into(),
                Value::Array(vec![Value::Str(A2DP_SINK_UUID.into())]),
            ),
        ])]),
    );
}

fn configure_sink_transport(registry: &Registry, transport: &str) -> MethodReturn {
    let caps = SbcCapabilities::parse(&host_capabilities(Profile::A2dpSink)).unwrap();
    let selected = select_sbc_configuration(
        &caps,
        &SampleSpec {
            rate: 48000,
            channels: 2,
        },
    )
    .unwrap();
    registry.handle_method_call(&endpoint_call(
        Profile::A2dpSink,
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
    ))
}

#[test]
fn discovery_queries_each_audio_interface_exactly_once() {
    let (bus, registry) = start_with_host(48000);
    discover_device(&bus, &registry);

    assert_eq!(bus.calls_to(Interface::AudioSink, "GetProperties").len(), 1);
    assert_eq!(bus.calls_to(Interface::Audio, "GetProperties").len(), 1);

    // A repeated UUID listing adds nothing.
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

    let device = registry.find_device_by_path(DEV).unwrap();
    assert_eq!(device.form_factor(), btaudio::FormFactor::Headphone);
}

#[test]
fn full_capabilities_at_48k_select_joint_stereo_51() {
    let (_bus, registry) = start_with_host(48000);
    let ret = registry.handle_method_call(&endpoint_call(
        Profile::A2dpSink,
        "SelectConfiguration",
        vec![Value::Bytes(host_capabilities(Profile::A2dpSink))],
    ));

    let MethodReturn::Ok(values) = ret else {
        panic!("selection failed: {ret:?}");
    };
    let params = SbcParams::from_bytes(values[0].as_bytes().unwrap()).unwrap();
    assert_eq!(params.rate, 48000);
    assert_eq!(params.mode, ChannelMode::JointStereo);
    assert_eq!(params.blocks, 16);
    assert_eq!(params.subbands, 8);
    assert_eq!(params.allocation, Allocation::Loudness);
    assert_eq!(params.max_bitpool, 51);
}

#[test]
fn duplicate_configuration_for_a_profile_pair_is_refused() {
    let (bus, registry) = start_with_host(48000);
    discover_device(&bus, &registry);

    assert_eq!(configure_sink_transport(&registry, "/t0"), MethodReturn::Ok(vec![]));
    // Same transport path again.
    assert!(matches!(
        configure_sink_transport(&registry, "/t0"),
        MethodReturn::Fault {
            name: FAULT_INVALID_ARGUMENTS,
            ..
        }
    ));
    // Different path, same (device, profile) pair.
    assert!(matches!(
        configure_sink_transport(&registry, "/t1"),
        MethodReturn::Fault {
            name: FAULT_INVALID_ARGUMENTS,
            ..
        }
    ));
}

#[test]
fn clear_configuration_releases_and_repeats_quietly() {
    let (bus, registry) = start_with_host(48000);
    discover_device(&bus, &registry);
    configure_sink_transport(&registry, "/t0");
    let events = registry.subscribe();

    let clear = endpoint_call(
        Profile::A2dpSink,
        "ClearConfiguration",
        vec![Value::ObjectPath("/t0".into())],
    );
    assert_eq!(registry.handle_method_call(&clear), MethodReturn::Ok(vec![]));
    assert!(matches!(
        events.try_recv().unwrap(),
        DriverEvent::TransportStateChanged {
            state: TransportState::Disconnected,
            ..
        }
    ));
    assert!(registry.transport("/t0").is_none());

    // Idempotent: a second clear neither errors nor fires events.
    assert_eq!(registry.handle_method_call(&clear), MethodReturn::Ok(vec![]));
    assert!(events.try_recv().is_err());

    // The profile slot is free again.
    assert_eq!(configure_sink_transport(&registry, "/t2"), MethodReturn::Ok(vec![]));
}

#[test]
fn daemon_loss_mid_query_resets_discovery() {
    let (bus, registry) = start_with_host(48000);
    discover_device(&bus, &registry);
    configure_sink_transport(&registry, "/t0");
    let events = registry.subscribe();

    // A pending interface query answers with ServiceUnknown.
    let (serial, _) = bus.calls_to(Interface::Audio, "GetProperties")[0];
    registry.handle_reply(
        serial,
        &Reply::Err {
            name: btaudio::error::FAULT_SERVICE_UNKNOWN.into(),
            message: "daemon gone".into(),
        },
    );

    assert!(registry.find_device_by_path(DEV).is_none());
    assert!(registry.transport("/t0").is_none());
    assert!(matches!(
        events.try_recv().unwrap(),
        DriverEvent::TransportStateChanged {
            state: TransportState::Disconnected,
            ..
        }
    ));

    // When the daemon returns, discovery starts over.
    registry.handle_signal(&signal(
        Interface::DBus,
        "/org/freedesktop/DBus",
        "NameOwnerChanged",
        vec![
            Value::Str(SERVICE_NAME.into()),
            Value::Str("".into()),
            Value::Str(":1.100".into()),
        ],
    ));
    assert_eq!(bus.calls_to(Interface::Manager, "ListAdapters").len(), 2);
}

#[test]
fn playback_state_walk_fires_events_in_cause_order() {
    let (bus, registry) = start_with_host(48000);
    discover_device(&bus, &registry);
    configure_sink_transport(&registry, "/t0");
    let events = registry.subscribe();

    for state in ["connected", "playing", "connected", "disconnected"] {
        registry.handle_signal(&signal(
            Interface::Audio,
            DEV,
            "PropertyChanged",
            vec![Value::Str("State".into()), Value::Str(state.into())],
        ));
        registry.handle_signal(&signal(
            Interface::AudioSink,
            DEV,
            "PropertyChanged",
            vec![Value::Str("State".into()), Value::Str(state.into())],
        ));
    }

    let collected: Vec<DriverEvent> = events.try_iter().collect();
    let expected = [
        DriverEvent::TransportStateChanged {
            path: "/t0".into(),
            state: TransportState::Idle,
        },
        DriverEvent::DeviceConnectionChanged {
            path: DEV.into(),
            connected: true,
        },
        DriverEvent::TransportStateChanged {
            path: "/t0".into(),
            state: TransportState::Playing,
        },
        DriverEvent::TransportStateChanged {
            path: "/t0".into(),
            state: TransportState::Idle,
        },
        DriverEvent::TransportStateChanged {
            path: "/t0".into(),
            state: TransportState::Disconnected,
        },
        DriverEvent::DeviceConnectionChanged {
            path: DEV.into(),
            connected: false,
        },
    ];
    assert_eq!(collected, expected);
}
