//! # btaudio
//!
//! Bluetooth audio driver core: device discovery over the Bluetooth
//! daemon's message bus, SBC endpoint negotiation and real-time A2DP and
//! HSP/HFP audio transport.
//!
//! The crate is organized around three pieces:
//! - [`registry::Registry`] mirrors the daemon's object tree (adapters,
//!   devices, transports) and serves our media endpoint objects
//! - [`endpoint`] selects SBC configurations from peer capabilities
//! - [`stream`] moves audio between an acquired transport socket and PCM
//!   channels on a dedicated IO thread
//!
//! [`binding::DeviceBinding`] ties the three together for one device and
//! profile.

pub mod binding;
pub mod bus;
pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod profile;
pub mod registry;
pub mod rtp;
pub mod sbc;
pub mod smoother;
pub mod stream;
pub mod transport;

pub use binding::{DeviceBinding, DeviceSelector};
pub use config::{DriverConfig, SampleSpec};
pub use device::{AudioState, Device, FormFactor};
pub use error::{Error, NegotiationError, ProtocolError, Result, StreamError};
pub use events::DriverEvent;
pub use profile::Profile;
pub use registry::Registry;
pub use sbc::{SbcCapabilities, SbcCodec, SbcParams};
pub use stream::{StreamCommand, StreamEvent, StreamHandle};
pub use transport::{AcquiredTransport, Transport, TransportState};
