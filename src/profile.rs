//! Audio profiles and their service UUIDs.

use std::time::Duration;

use uuid::Uuid;

use crate::bus::Interface;

/// A2DP sink service class (the remote renders audio we send).
pub const A2DP_SINK_UUID: &str = "0000110b-0000-1000-8000-00805f9b34fb";
/// A2DP source service class (the remote sends audio to us).
pub const A2DP_SOURCE_UUID: &str = "0000110a-0000-1000-8000-00805f9b34fb";
/// HSP headset role.
pub const HSP_HS_UUID: &str = "00001108-0000-1000-8000-00805f9b34fb";
/// HFP handsfree role.
pub const HFP_HF_UUID: &str = "0000111e-0000-1000-8000-00805f9b34fb";
/// HFP audio gateway role.
pub const HFP_AG_UUID: &str = "0000111f-0000-1000-8000-00805f9b34fb";

/// Fixed playback latency added on top of the buffered amount.
pub const FIXED_LATENCY_PLAYBACK_A2DP: Duration = Duration::from_millis(25);
pub const FIXED_LATENCY_RECORD_A2DP: Duration = Duration::from_millis(25);
pub const FIXED_LATENCY_PLAYBACK_HSP: Duration = Duration::from_millis(125);
pub const FIXED_LATENCY_RECORD_HSP: Duration = Duration::from_millis(25);

/// One audio profile of a remote device. A device carries at most one
/// transport per profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// A2DP towards the remote sink (we encode and send).
    A2dpSink,
    /// A2DP from the remote source (we receive and decode).
    A2dpSource,
    /// HSP/HFP headset link (bidirectional SCO audio).
    Hsp,
    /// HFP gateway link.
    HfGateway,
}

/// All profiles, indexable by [`Profile::index`].
pub const PROFILES: [Profile; 4] = [
    Profile::A2dpSink,
    Profile::A2dpSource,
    Profile::Hsp,
    Profile::HfGateway,
];

impl Profile {
    /// Stable slot index into per-device transport arrays.
    pub fn index(self) -> usize {
        match self {
            Profile::A2dpSink => 0,
            Profile::A2dpSource => 1,
            Profile::Hsp => 2,
            Profile::HfGateway => 3,
        }
    }

    /// Local endpoint object path registered for this profile.
    pub fn endpoint_path(self) -> &'static str {
        match self {
            Profile::A2dpSink => "/MediaEndpoint/A2DPSource",
            Profile::A2dpSource => "/MediaEndpoint/A2DPSink",
            Profile::Hsp => "/MediaEndpoint/HFPAG",
            Profile::HfGateway => "/MediaEndpoint/HFPHS",
        }
    }

    /// Find the profile owning a local endpoint path.
    pub fn from_endpoint_path(path: &str) -> Option<Self> {
        PROFILES.iter().copied().find(|p| p.endpoint_path() == path)
    }

    /// Remote service UUID advertised by the peer for this profile.
    pub fn remote_uuid(self) -> &'static str {
        match self {
            Profile::A2dpSink => A2DP_SINK_UUID,
            Profile::A2dpSource => A2DP_SOURCE_UUID,
            Profile::Hsp => HSP_HS_UUID,
            Profile::HfGateway => HFP_AG_UUID,
        }
    }

    /// Bus interface carrying this profile's state on the device object.
    pub fn interface(self) -> Interface {
        match self {
            Profile::A2dpSink => Interface::AudioSink,
            Profile::A2dpSource => Interface::AudioSource,
            Profile::Hsp => Interface::Headset,
            Profile::HfGateway => Interface::HandsfreeGateway,
        }
    }

    /// Whether this profile uses the SBC/RTP framing (A2DP) or raw SCO
    /// packets (HSP/HFP).
    pub fn uses_rtp(self) -> bool {
        matches!(self, Profile::A2dpSink | Profile::A2dpSource)
    }

    /// True when the profile renders host audio out to the peer.
    pub fn has_playback(self) -> bool {
        matches!(self, Profile::A2dpSink | Profile::Hsp | Profile::HfGateway)
    }

    /// True when the profile captures audio from the peer.
    pub fn has_record(self) -> bool {
        matches!(self, Profile::A2dpSource | Profile::Hsp | Profile::HfGateway)
    }

    pub fn fixed_playback_latency(self) -> Duration {
        if self.uses_rtp() {
            FIXED_LATENCY_PLAYBACK_A2DP
        } else {
            FIXED_LATENCY_PLAYBACK_HSP
        }
    }

    pub fn fixed_record_latency(self) -> Duration {
        if self.uses_rtp() {
            FIXED_LATENCY_RECORD_A2DP
        } else {
            FIXED_LATENCY_RECORD_HSP
        }
    }
}

/// Map a remote service UUID onto the bus interface to query for
/// capabilities. Unknown UUIDs map to `None` and trigger no query.
pub fn interface_for_uuid(uuid: &Uuid) -> Option<Interface> {
    let table: [(&str, Interface); 5] = [
        (A2DP_SINK_UUID, Interface::AudioSink),
        (A2DP_SOURCE_UUID, Interface::AudioSource),
        (HSP_HS_UUID, Interface::Headset),
        (HFP_HF_UUID, Interface::Headset),
        (HFP_AG_UUID, Interface::HandsfreeGateway),
    ];
    for (s, iface) in table {
        // Constants are well-formed; parsing cannot fail.
        if Uuid::parse_str(s).ok().as_ref() == Some(uuid) {
            return Some(iface);
        }
    }
    None
}

/// True when the UUID advertises any audio service.
pub fn is_audio_uuid(uuid: &Uuid) -> bool {
    interface_for_uuid(uuid).is_some()
}
