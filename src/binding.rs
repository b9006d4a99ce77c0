//! Binds one (device, profile) pair to a running stream engine.
//!
//! The registry tracks every peer the daemon knows about; a binding picks
//! one device and one profile and turns its transport into live audio.
//! Transport state drives the stream lifecycle: `Playing` brings the
//! stream up, `Idle` lets a playback-only stream keep running but tears
//! down capture-paced ones, `Disconnected` releases everything.

use tracing::{debug, info, warn};

use crate::config::SampleSpec;
use crate::error::{Error, Result};
use crate::events::DriverEvent;
use crate::profile::Profile;
use crate::registry::Registry;
use crate::sbc::SbcParams;
use crate::stream::{spawn_stream, StreamCommand, StreamEvent, StreamHandle};
use crate::transport::TransportState;

/// How a binding locates its device.
#[derive(Debug, Clone)]
pub enum DeviceSelector {
    Path(String),
    Address(String),
}

/// One device/profile pair bound to host audio.
#[derive(Debug)]
pub struct DeviceBinding {
    registry: Registry,
    device_path: String,
    profile: Profile,
    spec: SampleSpec,
    transport_path: String,
    stream: Option<StreamHandle>,
}

impl DeviceBinding {
    /// Bind a resolved device's transport for the given profile. Fails if
    /// the device is unknown or has no transport negotiated for the
    /// profile yet.
    pub fn bind(
        registry: Registry,
        selector: &DeviceSelector,
        profile: Profile,
        spec: SampleSpec,
    ) -> Result<DeviceBinding> {
        let device = match selector {
            DeviceSelector::Path(path) => registry.find_device_by_path(path),
            DeviceSelector::Address(address) => registry.find_device_by_address(address),
        }
        .ok_or_else(|| Error::NotFound(format!("{selector:?}")))?;

        let transport_path = device
            .transport_for(profile)
            .ok_or_else(|| Error::NotFound(format!("no {profile:?} transport on {}", device.path)))?
            .to_owned();

        // HSP/HFP audio is fixed narrowband regardless of the host spec.
        let spec = if profile.uses_rtp() {
            spec
        } else {
            SampleSpec::SCO
        };

        info!(device = %device.display_name(), ?profile, "device bound");
        Ok(DeviceBinding {
            registry,
            device_path: device.path,
            profile,
            spec,
            transport_path,
            stream: None,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn transport_path(&self) -> &str {
        &self.transport_path
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Current stream handle, for latency queries and PCM transfer.
    pub fn stream(&self) -> Option<&StreamHandle> {
        self.stream.as_ref()
    }

    /// React to a registry event. Events for other devices or transports
    /// are ignored.
    pub fn handle_event(&mut self, event: &DriverEvent) {
        match event {
            DriverEvent::TransportStateChanged { path, state } if *path == self.transport_path => {
                self.apply_transport_state(*state);
            }
            DriverEvent::DeviceConnectionChanged { path, connected: false }
                if *path == self.device_path =>
            {
                self.teardown_stream();
            }
            _ => {}
        }
    }

    /// Drain and react to events from the stream engine itself.
    pub fn poll_stream(&mut self) {
        let mut hung_up = false;
        let mut failed = false;
        if let Some(stream) = &self.stream {
            while let Ok(event) = stream.events().try_recv() {
                match event {
                    StreamEvent::HungUp => hung_up = true,
                    StreamEvent::IoFailed => failed = true,
                    StreamEvent::BitpoolChanged(bitpool) => {
                        debug!(bitpool, "encoder quality reduced");
                    }
                }
            }
        }
        self.apply_stream_failures(hung_up, failed);
    }

    /// An IO failure kills the session. A hang-up only kills the stream:
    /// the peer closed the socket without dropping the transport, so the
    /// stale acquire goes back and the stream is rebuilt straight away
    /// while the transport still reports playing; otherwise the next
    /// transport state change decides.
    fn apply_stream_failures(&mut self, hung_up: bool, failed: bool) {
        if failed {
            warn!(transport = %self.transport_path, "stream IO failed");
            self.teardown_stream();
        } else if hung_up {
            info!(transport = %self.transport_path, "stream hung up");
            self.teardown_stream();
            let playing = self
                .registry
                .transport(&self.transport_path)
                .is_some_and(|t| t.state == TransportState::Playing);
            if playing {
                if let Err(err) = self.set_up_stream(true) {
                    warn!(error = %err, "stream rebuild failed");
                }
            }
        }
    }

    fn apply_transport_state(&mut self, state: TransportState) {
        match state {
            TransportState::Playing => {
                if self.stream.is_none() {
                    if let Err(err) = self.set_up_stream(false) {
                        warn!(error = %err, "stream setup failed");
                    }
                }
            }
            TransportState::Idle => {
                // A2DP playback may keep the stream acquired while idle;
                // capture and SCO streams hand the socket back.
                if self.profile.has_record() || !self.profile.uses_rtp() {
                    self.teardown_stream();
                }
            }
            TransportState::Disconnected => self.teardown_stream(),
        }
    }

    /// Acquire the transport socket and spawn the IO thread. `optional`
    /// only acquires when the remote is already streaming, which is how
    /// capture avoids forcing a phone into call audio.
    pub fn set_up_stream(&mut self, optional: bool) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let transport = self
            .registry
            .transport(&self.transport_path)
            .ok_or_else(|| Error::NotFound(self.transport_path.clone()))?;

        let sbc = if self.profile.uses_rtp() {
            Some(SbcParams::from_bytes(&transport.config).map_err(Error::Negotiation)?)
        } else {
            None
        };

        let acquired = self.registry.acquire_transport(&self.transport_path, optional)?;
        let handle = spawn_stream(self.profile, self.spec, sbc, acquired)?;
        if self.profile.has_playback() {
            handle.command(StreamCommand::StartPlayback);
        }
        if self.profile.has_record() {
            handle.command(StreamCommand::StartRecord);
        }
        info!(transport = %self.transport_path, profile = ?self.profile, "stream started");
        self.stream = Some(handle);
        Ok(())
    }

    fn teardown_stream(&mut self) {
        if self.stream.take().is_some() {
            debug!(transport = %self.transport_path, "stream stopped");
            if let Err(err) = self.registry.release_transport(&self.transport_path) {
                // The owner may already be gone; nothing left to release.
                debug!(error = %err, "transport release failed");
            }
        }
    }
}

impl Drop for DeviceBinding {
    fn drop(&mut self) {
        self.teardown_stream();
    }
}
