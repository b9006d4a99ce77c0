//! Driver configuration and sample-spec arithmetic.

use std::time::Duration;

/// PCM sample layout of a stream (format is always S16LE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    pub rate: u32,
    pub channels: u8,
}

impl SampleSpec {
    /// Fixed HSP/HFP narrowband spec.
    pub const SCO: SampleSpec = SampleSpec {
        rate: 8000,
        channels: 1,
    };

    /// Bytes per PCM frame (S16 interleaved).
    pub fn frame_size(&self) -> usize {
        2 * self.channels as usize
    }

    pub fn byte_rate(&self) -> u64 {
        self.rate as u64 * self.frame_size() as u64
    }

    pub fn is_frame_aligned(&self, bytes: usize) -> bool {
        bytes % self.frame_size() == 0
    }

    pub fn bytes_to_duration(&self, bytes: u64) -> Duration {
        Duration::from_nanos(bytes.saturating_mul(1_000_000_000) / self.byte_rate())
    }

    /// Frame-aligned byte count covering the duration.
    pub fn duration_to_bytes(&self, duration: Duration) -> u64 {
        let bytes = duration.as_nanos() as u64 * self.byte_rate() / 1_000_000_000;
        bytes - bytes % self.frame_size() as u64
    }
}

impl Default for SampleSpec {
    fn default() -> Self {
        SampleSpec {
            rate: 44100,
            channels: 2,
        }
    }
}

/// Driver-level configuration (the module-argument surface).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Host default sample spec; drives A2DP rate/mode selection.
    pub default_spec: SampleSpec,
    /// Only track the device with this address, when set.
    pub address_filter: Option<String>,
    /// Register A2DP endpoints on new adapters.
    pub enable_a2dp: bool,
    /// Register HSP/HFP endpoints on new adapters.
    pub enable_hsp: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            default_spec: SampleSpec::default(),
            address_filter: None,
            enable_a2dp: true,
            enable_hsp: true,
        }
    }
}
