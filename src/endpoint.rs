//! Local media endpoint: capability advertisement and configuration
//! selection.
//!
//! The daemon forwards a peer's capability blob to `SelectConfiguration`;
//! the selection here is a pure function of the peer capabilities and the
//! host's default sample spec, so identical inputs always pick the same
//! configuration.

use crate::bus::Value;
use crate::config::SampleSpec;
use crate::error::{NegotiationError, ProtocolError};
use crate::profile::Profile;
use crate::sbc::{
    default_bitpool, Allocation, ChannelMode, SbcCapabilities, SbcParams, MAX_BITPOOL, MIN_BITPOOL,
    SBC_ALLOCATION_LOUDNESS, SBC_ALLOCATION_SNR, SBC_BLOCKS_12, SBC_BLOCKS_16, SBC_BLOCKS_4,
    SBC_BLOCKS_8, SBC_FREQ_16000, SBC_FREQ_32000, SBC_FREQ_44100, SBC_FREQ_48000, SBC_MODE_DUAL_CHANNEL,
    SBC_MODE_JOINT_STEREO, SBC_MODE_MONO, SBC_MODE_STEREO, SBC_SUBBANDS_4, SBC_SUBBANDS_8,
};

/// Introspection document served by every endpoint object.
pub const ENDPOINT_INTROSPECT_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN" "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
 <interface name="org.bluez.MediaEndpoint">
  <method name="SetConfiguration">
   <arg name="transport" direction="in" type="o"/>
   <arg name="properties" direction="in" type="a{sv}"/>
  </method>
  <method name="SelectConfiguration">
   <arg name="capabilities" direction="in" type="ay"/>
   <arg name="configuration" direction="out" type="ay"/>
  </method>
  <method name="ClearConfiguration">
   <arg name="transport" direction="in" type="o"/>
  </method>
  <method name="Release">
  </method>
 </interface>
 <interface name="org.freedesktop.DBus.Introspectable">
  <method name="Introspect">
   <arg name="data" direction="out" type="s"/>
  </method>
 </interface>
</node>
"#;

/// Capability blob we register with the daemon for a profile. A2DP
/// endpoints advertise every SBC setting; SCO endpoints carry a single
/// placeholder byte.
pub fn host_capabilities(profile: Profile) -> Vec<u8> {
    if profile.uses_rtp() {
        SbcCapabilities {
            frequencies: SBC_FREQ_16000 | SBC_FREQ_32000 | SBC_FREQ_44100 | SBC_FREQ_48000,
            channel_modes: SBC_MODE_MONO
                | SBC_MODE_DUAL_CHANNEL
                | SBC_MODE_STEREO
                | SBC_MODE_JOINT_STEREO,
            block_lengths: SBC_BLOCKS_4 | SBC_BLOCKS_8 | SBC_BLOCKS_12 | SBC_BLOCKS_16,
            subbands: SBC_SUBBANDS_4 | SBC_SUBBANDS_8,
            allocations: SBC_ALLOCATION_SNR | SBC_ALLOCATION_LOUDNESS,
            min_bitpool: MIN_BITPOOL,
            max_bitpool: MAX_BITPOOL,
        }
        .to_bytes()
        .to_vec()
    } else {
        vec![0x00]
    }
}

/// Pick a full SBC configuration from the peer's capability masks.
pub fn select_sbc_configuration(
    caps: &SbcCapabilities,
    host: &SampleSpec,
) -> Result<SbcParams, NegotiationError> {
    let rate = select_rate(caps.frequencies, host.rate)?;
    let mode = select_mode(caps.channel_modes, host.channels)?;

    let blocks = if caps.block_lengths & SBC_BLOCKS_16 != 0 {
        16
    } else if caps.block_lengths & SBC_BLOCKS_12 != 0 {
        12
    } else if caps.block_lengths & SBC_BLOCKS_8 != 0 {
        8
    } else if caps.block_lengths & SBC_BLOCKS_4 != 0 {
        4
    } else {
        return Err(NegotiationError::NoSupportedBlockLength);
    };

    let subbands = if caps.subbands & SBC_SUBBANDS_8 != 0 {
        8
    } else if caps.subbands & SBC_SUBBANDS_4 != 0 {
        4
    } else {
        return Err(NegotiationError::NoSupportedSubbands);
    };

    let allocation = if caps.allocations & SBC_ALLOCATION_LOUDNESS != 0 {
        Allocation::Loudness
    } else if caps.allocations & SBC_ALLOCATION_SNR != 0 {
        Allocation::Snr
    } else {
        return Err(NegotiationError::NoSupportedAllocation);
    };

    // Intersect the peer's bitpool range with ours, capped at the default
    // quality bitpool for the selected rate and mode.
    let min_bitpool = caps.min_bitpool.max(MIN_BITPOOL);
    let max_bitpool = caps.max_bitpool.min(default_bitpool(rate, mode));
    if max_bitpool < min_bitpool {
        return Err(NegotiationError::BitpoolRangeEmpty {
            peer_min: caps.min_bitpool,
            peer_max: caps.max_bitpool,
        });
    }

    Ok(SbcParams {
        rate,
        mode,
        blocks,
        subbands,
        allocation,
        min_bitpool,
        max_bitpool,
    })
}

/// Lowest supported rate at or above the host rate; otherwise the highest
/// supported rate below it.
fn select_rate(mask: u8, host_rate: u32) -> Result<u32, NegotiationError> {
    const RATES: [(u32, u8); 4] = [
        (16000, SBC_FREQ_16000),
        (32000, SBC_FREQ_32000),
        (44100, SBC_FREQ_44100),
        (48000, SBC_FREQ_48000),
    ];

    for (rate, bit) in RATES {
        if mask & bit != 0 && rate >= host_rate {
            return Ok(rate);
        }
    }
    for (rate, bit) in RATES.into_iter().rev() {
        if mask & bit != 0 {
            return Ok(rate);
        }
    }
    Err(NegotiationError::NoSupportedRate)
}

fn select_mode(mask: u8, host_channels: u8) -> Result<ChannelMode, NegotiationError> {
    let order: [(ChannelMode, u8); 4] = if host_channels >= 2 {
        [
            (ChannelMode::JointStereo, SBC_MODE_JOINT_STEREO),
            (ChannelMode::Stereo, SBC_MODE_STEREO),
            (ChannelMode::DualChannel, SBC_MODE_DUAL_CHANNEL),
            (ChannelMode::Mono, SBC_MODE_MONO),
        ]
    } else {
        [
            (ChannelMode::Mono, SBC_MODE_MONO),
            (ChannelMode::JointStereo, SBC_MODE_JOINT_STEREO),
            (ChannelMode::Stereo, SBC_MODE_STEREO),
            (ChannelMode::DualChannel, SBC_MODE_DUAL_CHANNEL),
        ]
    };
    order
        .into_iter()
        .find(|(_, bit)| mask & bit != 0)
        .map(|(mode, _)| mode)
        .ok_or(NegotiationError::NoSupportedChannelMode)
}

/// SCO endpoints carry a single fixed capability byte which is echoed
/// back unchanged.
pub fn select_sco_configuration(caps: &[u8]) -> Result<Vec<u8>, NegotiationError> {
    if caps.len() != 1 {
        return Err(NegotiationError::BadCapabilitySize {
            expected: 1,
            actual: caps.len(),
        });
    }
    Ok(caps.to_vec())
}

/// Parsed arguments of an inbound `SetConfiguration` call.
#[derive(Debug, Clone)]
pub struct SetConfigurationRequest {
    pub transport_path: String,
    pub device_path: String,
    pub configuration: Vec<u8>,
    pub nrec: Option<bool>,
}

pub fn parse_set_configuration(args: &[Value]) -> Result<SetConfigurationRequest, ProtocolError> {
    let transport_path = args
        .first()
        .ok_or(ProtocolError::MissingField("transport"))?
        .as_str()
        .ok_or(ProtocolError::UnexpectedType("transport"))?
        .to_owned();
    let props = args
        .get(1)
        .ok_or(ProtocolError::MissingField("properties"))?
        .as_dict()
        .ok_or(ProtocolError::UnexpectedType("properties"))?;

    let mut device_path = None;
    let mut configuration = None;
    let mut nrec = None;
    for (key, value) in props {
        match key.as_str() {
            "Device" => {
                device_path = Some(
                    value
                        .as_str()
                        .ok_or(ProtocolError::UnexpectedType("Device"))?
                        .to_owned(),
                );
            }
            "Configuration" => {
                configuration = Some(
                    value
                        .as_bytes()
                        .ok_or(ProtocolError::UnexpectedType("Configuration"))?
                        .to_vec(),
                );
            }
            "NREC" => {
                nrec = Some(value.as_bool().ok_or(ProtocolError::UnexpectedType("NREC"))?);
            }
            // Unknown properties are ignored.
            _ => {}
        }
    }

    Ok(SetConfigurationRequest {
        transport_path,
        device_path: device_path.ok_or(ProtocolError::MissingField("Device"))?,
        configuration: configuration.ok_or(ProtocolError::MissingField("Configuration"))?,
        nrec,
    })
}
