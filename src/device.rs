//! Remote device model.

use uuid::Uuid;

use crate::error::ProtocolError;
use crate::profile::{Profile, PROFILES};

/// A boolean property we may not have resolved yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tristate {
    #[default]
    Unknown,
    No,
    Yes,
}

impl From<bool> for Tristate {
    fn from(b: bool) -> Self {
        if b {
            Tristate::Yes
        } else {
            Tristate::No
        }
    }
}

/// Outcome of a device's initial property resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validity {
    /// Initial property query still outstanding.
    #[default]
    Pending,
    /// Resolved with a usable identity.
    Valid,
    /// Resolution failed; the device is never surfaced.
    Invalid,
}

/// Audio connection state of one bus interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioState {
    #[default]
    Invalid,
    Disconnected,
    Connecting,
    Connected,
    Playing,
}

impl AudioState {
    /// Parse the bus's state strings; anything unknown is `Invalid`.
    pub fn from_bus_str(s: &str) -> Self {
        match s {
            "disconnected" => AudioState::Disconnected,
            "connecting" => AudioState::Connecting,
            "connected" => AudioState::Connected,
            "playing" => AudioState::Playing,
            _ => AudioState::Invalid,
        }
    }
}

/// Device form factor derived from the class-of-device field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormFactor {
    Headset,
    Handsfree,
    Microphone,
    Speaker,
    Headphone,
    Portable,
    Car,
    Hifi,
    Phone,
    Unknown,
}

impl FormFactor {
    pub fn from_class(class: u32) -> Self {
        let major = (class >> 8) & 0x1f;
        let minor = (class >> 2) & 0x3f;
        match major {
            2 => FormFactor::Phone,
            4 => match minor {
                1 => FormFactor::Headset,
                2 => FormFactor::Handsfree,
                4 => FormFactor::Microphone,
                5 => FormFactor::Speaker,
                6 => FormFactor::Headphone,
                7 => FormFactor::Portable,
                8 => FormFactor::Car,
                10 => FormFactor::Hifi,
                _ => FormFactor::Unknown,
            },
            _ => FormFactor::Unknown,
        }
    }
}

/// A remote Bluetooth peer tracked by the registry.
#[derive(Debug, Clone)]
pub struct Device {
    /// Bus object path; immutable.
    pub path: String,
    /// Hardware address; immutable once set from the initial property
    /// resolution.
    pub address: Option<String>,
    pub name: Option<String>,
    pub alias: Option<String>,
    pub paired: Tristate,
    pub trusted: Tristate,
    pub class: Option<u32>,
    /// Advertised service UUIDs; append-only, deduplicated.
    uuids: Vec<Uuid>,
    /// State of the umbrella audio interface.
    pub audio_state: AudioState,
    /// Per-profile audio states, indexed by [`Profile::index`].
    pub profile_states: [AudioState; 4],
    /// Transport paths, one slot per profile.
    transports: [Option<String>; 4],
    /// Set when the device object vanished but references still exist.
    pub dead: bool,
    pub validity: Validity,
    /// Last value of the connection predicate, for edge detection.
    pub was_connected: bool,
}

impl Device {
    pub fn new(path: String) -> Self {
        Self {
            path,
            address: None,
            name: None,
            alias: None,
            paired: Tristate::Unknown,
            trusted: Tristate::Unknown,
            class: None,
            uuids: Vec::new(),
            audio_state: AudioState::Invalid,
            profile_states: [AudioState::Invalid; 4],
            transports: [None, None, None, None],
            dead: false,
            validity: Validity::Pending,
            was_connected: false,
        }
    }

    /// Set the hardware address from the initial resolution path. A
    /// conflicting rewrite is a protocol error.
    pub fn set_address(&mut self, address: &str) -> Result<(), ProtocolError> {
        match &self.address {
            Some(existing) if existing != address => Err(ProtocolError::ImmutableProperty {
                property: "Address",
                path: self.path.clone(),
            }),
            _ => {
                self.address = Some(address.to_owned());
                Ok(())
            }
        }
    }

    /// Case-insensitive UUID membership.
    pub fn uuids_contains(&self, uuid: &Uuid) -> bool {
        self.uuids.contains(uuid)
    }

    /// Append a UUID; duplicates are a no-op. Returns true when the UUID
    /// was new.
    pub fn add_uuid(&mut self, uuid: Uuid) -> bool {
        if self.uuids_contains(&uuid) {
            return false;
        }
        self.uuids.push(uuid);
        true
    }

    pub fn uuids(&self) -> &[Uuid] {
        &self.uuids
    }

    pub fn form_factor(&self) -> FormFactor {
        self.class.map_or(FormFactor::Unknown, FormFactor::from_class)
    }

    pub fn transport_for(&self, profile: Profile) -> Option<&str> {
        self.transports[profile.index()].as_deref()
    }

    /// Occupy the profile slot. Fails if a transport is already bound to
    /// this (device, profile) pair.
    pub fn bind_transport(&mut self, profile: Profile, path: String) -> Result<(), ProtocolError> {
        let slot = &mut self.transports[profile.index()];
        if slot.is_some() {
            return Err(ProtocolError::Malformed(format!(
                "profile slot {profile:?} already bound on {}",
                self.path
            )));
        }
        *slot = Some(path);
        Ok(())
    }

    pub fn unbind_transport(&mut self, profile: Profile) -> Option<String> {
        self.transports[profile.index()].take()
    }

    /// Transport paths currently bound, with their profiles.
    pub fn bound_transports(&self) -> impl Iterator<Item = (Profile, &str)> {
        PROFILES
            .iter()
            .filter_map(|p| self.transports[p.index()].as_deref().map(|t| (*p, t)))
    }

    pub fn display_name(&self) -> &str {
        self.alias
            .as_deref()
            .or(self.name.as_deref())
            .or(self.address.as_deref())
            .unwrap_or(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> Device {
        Device::new("/org/bluez/hci0/dev_00_11_22_33_44_55".into())
    }

    mod address {
        use super::*;

        #[test]
        fn first_write_succeeds() {
            let mut d = dev();
            d.set_address("00:11:22:33:44:55").unwrap();
            assert_eq!(d.address.as_deref(), Some("00:11:22:33:44:55"));
        }

        #[test]
        fn identical_rewrite_is_fine() {
            let mut d = dev();
            d.set_address("00:11:22:33:44:55").unwrap();
            d.set_address("00:11:22:33:44:55").unwrap();
        }

        #[test]
        fn conflicting_rewrite_is_a_protocol_error() {
            let mut d = dev();
            d.set_address("00:11:22:33:44:55").unwrap();
            let err = d.set_address("aa:bb:cc:dd:ee:ff").unwrap_err();
            assert!(matches!(err, ProtocolError::ImmutableProperty { .. }));
        }
    }

    mod uuids {
        use super::*;

        #[test]
        fn add_is_deduplicated() {
            let mut d = dev();
            let u = Uuid::parse_str("0000110b-0000-1000-8000-00805f9b34fb").unwrap();
            assert!(d.add_uuid(u));
            assert!(!d.add_uuid(u));
            assert_eq!(d.uuids().len(), 1);
        }

        #[test]
        fn contains_is_case_insensitive() {
            let mut d = dev();
            let lower = Uuid::parse_str("0000110b-0000-1000-8000-00805f9b34fb").unwrap();
            let upper = Uuid::parse_str("0000110B-0000-1000-8000-00805F9B34FB").unwrap();
            d.add_uuid(lower);
            assert!(d.uuids_contains(&upper));
            assert!(!d.add_uuid(upper));
        }
    }

    mod transports {
        use super::*;

        #[test]
        fn one_transport_per_profile_slot() {
            let mut d = dev();
            d.bind_transport(Profile::Hsp, "/t0".into()).unwrap();
            assert!(d.bind_transport(Profile::Hsp, "/t1".into()).is_err());
            assert_eq!(d.transport_for(Profile::Hsp), Some("/t0"));
            // A different profile is unaffected.
            d.bind_transport(Profile::A2dpSink, "/t2".into()).unwrap();
        }

        #[test]
        fn unbind_clears_the_slot() {
            let mut d = dev();
            d.bind_transport(Profile::Hsp, "/t0".into()).unwrap();
            assert_eq!(d.unbind_transport(Profile::Hsp), Some("/t0".into()));
            assert_eq!(d.transport_for(Profile::Hsp), None);
            assert_eq!(d.unbind_transport(Profile::Hsp), None);
        }
    }

    mod form_factor {
        use super::*;

        #[test]
        fn audio_minor_classes_map() {
            // Major 4 (audio/video), minor 1 (headset): 0x0404
            assert_eq!(FormFactor::from_class(0x0404), FormFactor::Headset);
            // minor 6 (headphone): 0x0418
            assert_eq!(FormFactor::from_class(0x0418), FormFactor::Headphone);
            // minor 8 (car audio): 0x0420
            assert_eq!(FormFactor::from_class(0x0420), FormFactor::Car);
        }

        #[test]
        fn phone_major_class_maps() {
            assert_eq!(FormFactor::from_class(0x0200), FormFactor::Phone);
        }

        #[test]
        fn unknown_class_is_unknown() {
            assert_eq!(FormFactor::from_class(0x0100), FormFactor::Unknown);
            let d = dev();
            assert_eq!(d.form_factor(), FormFactor::Unknown);
        }
    }

    #[test]
    fn audio_state_parses_bus_strings() {
        assert_eq!(AudioState::from_bus_str("connected"), AudioState::Connected);
        assert_eq!(AudioState::from_bus_str("playing"), AudioState::Playing);
        assert_eq!(AudioState::from_bus_str("connecting"), AudioState::Connecting);
        assert_eq!(
            AudioState::from_bus_str("disconnected"),
            AudioState::Disconnected
        );
        assert_eq!(AudioState::from_bus_str("warp-drive"), AudioState::Invalid);
    }

    #[test]
    fn display_name_prefers_alias() {
        let mut d = dev();
        assert_eq!(d.display_name(), d.path.clone());
        d.set_address("00:11:22:33:44:55").unwrap();
        d.name = Some("BT Speaker".into());
        d.alias = Some("Kitchen".into());
        assert_eq!(d.display_name(), "Kitchen");
    }
}
