//! Negotiated audio stream endpoints.

use std::os::unix::io::RawFd;

use crate::device::AudioState;
use crate::profile::Profile;

/// Maximum HSP microphone/speaker gain value.
pub const GAIN_MAX: u16 = 15;

/// Transport lifecycle state, derived from the owning device's
/// per-profile audio state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Device is disconnected or still connecting.
    Disconnected,
    /// Link is up but no audio is flowing.
    Idle,
    /// Audio is streaming.
    Playing,
}

impl TransportState {
    /// Monotone mapping from the device's audio state.
    pub fn from_audio_state(state: AudioState) -> Self {
        match state {
            AudioState::Invalid | AudioState::Disconnected | AudioState::Connecting => {
                TransportState::Disconnected
            }
            AudioState::Connected => TransportState::Idle,
            AudioState::Playing => TransportState::Playing,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, TransportState::Idle | TransportState::Playing)
    }
}

/// One negotiated (device, profile) audio stream endpoint.
///
/// Created when an endpoint configuration request is accepted, destroyed
/// when the peer clears it, the owning device goes away, or the registry
/// is torn down. The state is forced to `Disconnected` and a lifecycle
/// event fires before the transport is released; observers must not
/// retain it past that event.
#[derive(Debug, Clone)]
pub struct Transport {
    /// Bus object path of the transport.
    pub path: String,
    pub profile: Profile,
    /// Path of the owning device (non-owning back-reference).
    pub device_path: String,
    /// Bus name of the remote owner; acquire/release calls go there.
    pub owner: String,
    /// Opaque negotiated codec configuration bytes.
    pub config: Vec<u8>,
    pub state: TransportState,
    /// HSP only, 0..=15.
    pub microphone_gain: u16,
    /// HSP only, 0..=15.
    pub speaker_gain: u16,
    /// HSP noise-reduction/echo-cancellation hint.
    pub nrec: bool,
}

impl Transport {
    pub fn new(
        path: String,
        profile: Profile,
        device_path: String,
        owner: String,
        config: Vec<u8>,
    ) -> Self {
        Self {
            path,
            profile,
            device_path,
            owner,
            config,
            state: TransportState::Disconnected,
            microphone_gain: 0,
            speaker_gain: 0,
            nrec: false,
        }
    }
}

/// Stream socket handed over by the transport's owner on acquisition.
#[derive(Debug, Clone, Copy)]
pub struct AcquiredTransport {
    pub fd: RawFd,
    pub read_mtu: u16,
    pub write_mtu: u16,
}
