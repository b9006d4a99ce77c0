//! Real-time transport engine.
//!
//! One dedicated IO thread per acquired transport moves audio between the
//! stream socket and a pair of PCM channels. A2DP playback encodes SBC
//! frames and packs as many as fit into one RTP packet per link MTU; A2DP
//! capture parses RTP, decodes and feeds a rate smoother from packet
//! arrival times. HSP/HFP moves raw SCO frames in both directions, pacing
//! writes off reads while capture is running and off the wall clock
//! otherwise.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::config::SampleSpec;
use crate::error::StreamError;
use crate::profile::Profile;
use crate::rtp::{split_packet, write_packet_header, PACKET_OVERHEAD};
use crate::sbc::{SbcCodec, SbcParams, BITPOOL_DEC_LIMIT, BITPOOL_DEC_STEP};
use crate::smoother::Smoother;
use crate::transport::AcquiredTransport;

/// Furthest a wall-clock paced playback stream may lag before it skips
/// ahead instead of bursting to catch up.
pub const MAX_PLAYBACK_CATCH_UP: Duration = Duration::from_millis(100);

/// After this long without playback data the pacing reference resets, so
/// a resuming stream does not burst.
const IDLE_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Consecutive full-socket deferrals before the encoder drops quality.
const CONGESTION_THRESHOLD: u32 = 3;

/// Poll granularity when no write deadline is nearer.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Commands accepted by the IO thread.
#[derive(Debug)]
pub enum StreamCommand {
    StartPlayback,
    StopPlayback,
    StartRecord,
    StopRecord,
}

/// Events the IO thread reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Unrecoverable socket failure; the stream is dead.
    IoFailed,
    /// The peer hung up the stream socket. The transport itself may
    /// still be alive; only the stream needs tearing down.
    HungUp,
    /// Congestion forced the SBC bitpool down.
    BitpoolChanged(u8),
}

/// Shared timing state for latency queries from the control thread.
pub struct StreamTiming {
    profile: Profile,
    spec: SampleSpec,
    epoch: Instant,
    inner: Mutex<TimingInner>,
}

#[derive(Default)]
struct TimingInner {
    /// PCM bytes accepted for playback since the stream started.
    write_index: u64,
    /// When playback started, relative to the epoch.
    playback_started: Option<Duration>,
    /// PCM bytes delivered to the capture channel.
    read_index: u64,
    smoother: Smoother,
}

impl StreamTiming {
    fn new(profile: Profile, spec: SampleSpec) -> Self {
        Self {
            profile,
            spec,
            epoch: Instant::now(),
            inner: Mutex::new(TimingInner {
                smoother: Smoother::new(),
                ..TimingInner::default()
            }),
        }
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn begin_playback(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.write_index = 0;
        inner.playback_started = Some(self.epoch.elapsed());
    }

    fn record_playback(&self, bytes: u64) {
        self.inner.lock().unwrap().write_index += bytes;
    }

    fn record_arrival(&self, bytes: u64, arrival: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_index += bytes;
        let position = self.spec.bytes_to_duration(inner.read_index);
        inner.smoother.resume(arrival);
        inner.smoother.put(arrival, position);
    }

    /// Estimated playback latency: audio written ahead of the link's read
    /// position, clamped at zero, plus the fixed link latency. The read
    /// position comes from the smoother while capture paces the link and
    /// from the wall clock otherwise.
    pub fn playback_latency(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        let written = self.spec.bytes_to_duration(inner.write_index);
        let position = if inner.read_index > 0 {
            inner.smoother.get(self.now())
        } else {
            match inner.playback_started {
                Some(started) => self.now().saturating_sub(started),
                None => written,
            }
        };
        self.profile.fixed_playback_latency() + written.saturating_sub(position)
    }

    /// Estimated record latency: audio the peer has captured but we have
    /// not yet delivered, plus the fixed link latency.
    pub fn record_latency(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        let estimated = inner.smoother.get(self.now());
        let delivered = self.spec.bytes_to_duration(inner.read_index);
        self.profile.fixed_record_latency() + estimated.saturating_sub(delivered)
    }
}

/// Packs PCM into SBC/RTP packets sized to the link MTU.
pub struct SinkPipeline {
    codec: SbcCodec,
    write_mtu: usize,
    frame_size: usize,
    sequence: u16,
    /// RTP timestamp, counted in PCM frames.
    timestamp: u32,
    pending: Vec<u8>,
    max_pending: usize,
    dropped: u64,
}

impl SinkPipeline {
    pub fn new(params: SbcParams, write_mtu: usize, spec: &SampleSpec) -> Self {
        // Seed at the negotiated maximum; congestion can only lower it.
        let codec = SbcCodec::new(params, params.max_bitpool);
        Self {
            codec,
            write_mtu,
            frame_size: spec.frame_size(),
            sequence: 0,
            timestamp: 0,
            pending: Vec::new(),
            max_pending: spec.duration_to_bytes(MAX_PLAYBACK_CATCH_UP) as usize,
            dropped: 0,
        }
    }

    /// One encode/send unit: as many whole SBC frames as fit in the MTU,
    /// in PCM bytes.
    pub fn block_size(&self) -> usize {
        let payload = self.write_mtu.saturating_sub(PACKET_OVERHEAD);
        let frames = (payload / self.codec.frame_length()).max(1);
        frames * self.codec.codesize()
    }

    pub fn bitpool(&self) -> u8 {
        self.codec.bitpool()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Queue PCM for sending. A backlog beyond the catch-up limit drops
    /// the oldest audio rather than letting the stream fall behind.
    /// Returns the number of bytes dropped.
    pub fn feed(&mut self, pcm: &[u8]) -> usize {
        self.pending.extend_from_slice(pcm);
        if self.pending.len() <= self.max_pending {
            return 0;
        }
        let mut excess = self.pending.len() - self.max_pending;
        excess -= excess % self.frame_size;
        self.pending.drain(..excess);
        self.dropped += excess as u64;
        excess
    }

    /// Build the next RTP packet, or `None` while less than one block is
    /// buffered.
    pub fn next_packet(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        let codesize = self.codec.codesize();
        if self.pending.len() < self.block_size() {
            return Ok(None);
        }

        let mut packet = vec![0u8; self.write_mtu];
        let mut offset = PACKET_OVERHEAD;
        let mut consumed = 0;
        let mut frames = 0u8;
        while self.pending.len() - consumed >= codesize
            && offset + self.codec.frame_length() <= self.write_mtu
            && frames < 15
        {
            let (used, written) = self
                .codec
                .encode(&self.pending[consumed..], &mut packet[offset..])?;
            consumed += used;
            offset += written;
            frames += 1;
        }
        if frames == 0 {
            return Err(StreamError::Encode);
        }

        write_packet_header(&mut packet, self.sequence, self.timestamp, frames);
        packet.truncate(offset);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self
            .timestamp
            .wrapping_add((consumed / self.frame_size) as u32);
        self.pending.drain(..consumed);
        Ok(Some(packet))
    }

    /// Drop encoding quality one step. Returns the new bitpool when it
    /// actually moved.
    pub fn reduce_bitpool(&mut self) -> Option<u8> {
        let current = self.codec.bitpool();
        if current <= BITPOOL_DEC_LIMIT {
            return None;
        }
        let target = current
            .saturating_sub(BITPOOL_DEC_STEP)
            .max(BITPOOL_DEC_LIMIT);
        if self.codec.set_bitpool(target) {
            Some(self.codec.bitpool())
        } else {
            None
        }
    }
}

/// Unpacks RTP/SBC packets into PCM.
pub struct SourcePipeline {
    codec: SbcCodec,
    last_sequence: Option<u16>,
}

impl SourcePipeline {
    pub fn new(params: SbcParams) -> Self {
        // Capture starts at the protocol minimum; the encoder side tells
        // us the real bitpool in each frame header.
        let codec = SbcCodec::new(params, params.min_bitpool);
        Self {
            codec,
            last_sequence: None,
        }
    }

    pub fn bitpool(&self) -> u8 {
        self.codec.bitpool()
    }

    /// Decode every frame of one RTP packet into PCM.
    pub fn depacketize(&mut self, packet: &[u8]) -> Result<Vec<u8>, StreamError> {
        let (header, payload_header, mut payload) = split_packet(packet)?;
        if let Some(last) = self.last_sequence {
            let expected = last.wrapping_add(1);
            if header.sequence != expected {
                debug!(
                    expected,
                    got = header.sequence,
                    "sequence discontinuity"
                );
            }
        }
        self.last_sequence = Some(header.sequence);

        let mut pcm = Vec::new();
        for _ in 0..payload_header.frame_count {
            if payload.is_empty() {
                return Err(StreamError::Decode);
            }
            let start = pcm.len();
            pcm.resize(start + self.codec.codesize(), 0);
            let (consumed, produced) = self.codec.decode(payload, &mut pcm[start..])?;
            pcm.truncate(start + produced);
            payload = &payload[consumed..];
        }
        Ok(pcm)
    }
}

/// Raw SCO passthrough for HSP/HFP.
pub struct ScoPipeline {
    frame_size: usize,
}

impl ScoPipeline {
    pub fn new(spec: &SampleSpec) -> Self {
        Self {
            frame_size: spec.frame_size(),
        }
    }

    /// Validate an inbound SCO packet. Frame-misaligned packets are
    /// discarded wholesale; resynchronization is the link's problem.
    pub fn accept<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        if packet.is_empty() || packet.len() % self.frame_size != 0 {
            return None;
        }
        Some(packet)
    }
}

/// Handle to a running stream engine. Dropping it stops and joins the IO
/// thread and closes the stream socket.
pub struct StreamHandle {
    commands: Sender<StreamCommand>,
    events: Receiver<StreamEvent>,
    pcm_in: Sender<Vec<u8>>,
    pcm_out: Receiver<Vec<u8>>,
    timing: Arc<StreamTiming>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}

impl StreamHandle {
    pub fn command(&self, command: StreamCommand) {
        let _ = self.commands.send(command);
    }

    /// Queue PCM for playback.
    pub fn write_pcm(&self, pcm: Vec<u8>) {
        let _ = self.pcm_in.send(pcm);
    }

    /// Captured PCM, one socket packet's worth per message.
    pub fn pcm_out(&self) -> &Receiver<Vec<u8>> {
        &self.pcm_out
    }

    pub fn events(&self) -> &Receiver<StreamEvent> {
        &self.events
    }

    pub fn timing(&self) -> &StreamTiming {
        &self.timing
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawn the IO thread for an acquired transport.
pub fn spawn_stream(
    profile: Profile,
    spec: SampleSpec,
    sbc: Option<SbcParams>,
    acquired: AcquiredTransport,
) -> std::io::Result<StreamHandle> {
    let (command_tx, command_rx) = unbounded();
    let (event_tx, event_rx) = unbounded();
    let (pcm_in_tx, pcm_in_rx) = unbounded();
    let (pcm_out_tx, pcm_out_rx) = bounded(64);
    let timing = Arc::new(StreamTiming::new(profile, spec));
    let stop = Arc::new(AtomicBool::new(false));

    let thread = {
        let timing = timing.clone();
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("bt-stream".into())
            .spawn(move || {
                let mut engine = Engine {
                    fd: StreamFd(acquired.fd),
                    profile,
                    spec,
                    read_mtu: acquired.read_mtu as usize,
                    write_mtu: acquired.write_mtu as usize,
                    sink: sbc.map(|p| SinkPipeline::new(p, acquired.write_mtu as usize, &spec)),
                    source: sbc.map(SourcePipeline::new),
                    sco: ScoPipeline::new(&spec),
                    commands: command_rx,
                    events: event_tx,
                    pcm_in: pcm_in_rx,
                    pcm_out: pcm_out_tx,
                    timing,
                    stop,
                    playback_running: false,
                    record_running: false,
                    write_blocked: false,
                    congestion: 0,
                    next_write: None,
                    last_fed: None,
                    sco_pending: Vec::new(),
                };
                engine.run();
            })?
    };

    Ok(StreamHandle {
        commands: command_tx,
        events: event_rx,
        pcm_in: pcm_in_tx,
        pcm_out: pcm_out_rx,
        timing,
        stop,
        thread: Some(thread),
    })
}

/// Owns the stream socket for the lifetime of the IO thread.
struct StreamFd(RawFd);

impl Drop for StreamFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

struct Engine {
    fd: StreamFd,
    profile: Profile,
    spec: SampleSpec,
    read_mtu: usize,
    write_mtu: usize,
    sink: Option<SinkPipeline>,
    source: Option<SourcePipeline>,
    sco: ScoPipeline,
    commands: Receiver<StreamCommand>,
    events: Sender<StreamEvent>,
    pcm_in: Receiver<Vec<u8>>,
    pcm_out: Sender<Vec<u8>>,
    timing: Arc<StreamTiming>,
    stop: Arc<AtomicBool>,
    playback_running: bool,
    record_running: bool,
    write_blocked: bool,
    congestion: u32,
    /// Wall-clock pacing deadline for the next write.
    next_write: Option<Instant>,
    last_fed: Option<Instant>,
    /// Outbound PCM awaiting transmission on an SCO link.
    sco_pending: Vec<u8>,
}

impl Engine {
    fn run(&mut self) {
        if let Err(err) = set_nonblocking(self.fd.0) {
            warn!(error = %err, "stream socket setup failed");
            let _ = self.events.send(StreamEvent::IoFailed);
            return;
        }
        if self.profile.has_record() {
            // Kernel arrival timestamps feed the smoother; a failure here
            // only costs estimation quality.
            if let Err(err) = enable_rx_timestamps(self.fd.0) {
                debug!(error = %err, "no kernel receive timestamps");
            }
        }
        info!(profile = ?self.profile, read_mtu = self.read_mtu, write_mtu = self.write_mtu, "stream running");

        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            self.drain_commands();
            self.pull_pcm();

            let mut pollfd = libc::pollfd {
                fd: self.fd.0,
                events: 0,
                revents: 0,
            };
            if self.record_running {
                pollfd.events |= libc::POLLIN;
            }
            if self.write_blocked {
                pollfd.events |= libc::POLLOUT;
            }

            let timeout = self.poll_timeout();
            let rc = unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as libc::c_int) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %err, "poll failed");
                let _ = self.events.send(StreamEvent::IoFailed);
                break;
            }

            if pollfd.revents & libc::POLLHUP != 0 {
                info!("peer hung up the stream");
                let _ = self.events.send(StreamEvent::HungUp);
                break;
            }
            if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                warn!("stream socket error condition");
                let _ = self.events.send(StreamEvent::IoFailed);
                break;
            }

            if pollfd.revents & libc::POLLOUT != 0 {
                self.write_blocked = false;
            }

            if pollfd.revents & libc::POLLIN != 0 {
                if !self.handle_readable() {
                    break;
                }
            }

            if self.playback_running && !self.write_blocked {
                if !self.handle_writes() {
                    break;
                }
            }
        }
    }

    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(StreamCommand::StartPlayback) => {
                    self.playback_running = true;
                    self.next_write = None;
                    self.timing.begin_playback();
                }
                Ok(StreamCommand::StopPlayback) => {
                    self.playback_running = false;
                    self.next_write = None;
                }
                Ok(StreamCommand::StartRecord) => self.record_running = true,
                Ok(StreamCommand::StopRecord) => self.record_running = false,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.stop.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }
    }

    /// Move queued PCM from the channel into the sink pipeline.
    fn pull_pcm(&mut self) {
        let mut fed = false;
        while let Ok(pcm) = self.pcm_in.try_recv() {
            let dropped = if let Some(sink) = &mut self.sink {
                sink.feed(&pcm)
            } else {
                self.sco_feed(&pcm)
            };
            self.timing.record_playback(pcm.len() as u64);
            if dropped > 0 {
                warn!(dropped, "playback backlog over the catch-up limit; dropping audio");
                self.reduce_quality();
            }
            fed = true;
        }
        if fed {
            let now = Instant::now();
            if let Some(last) = self.last_fed {
                if now.duration_since(last) > IDLE_WRITE_TIMEOUT {
                    // Long gap: restart pacing instead of bursting.
                    self.next_write = None;
                }
            }
            self.last_fed = Some(now);
        }
    }

    fn poll_timeout(&self) -> Duration {
        if !self.playback_running || self.write_blocked {
            return POLL_INTERVAL;
        }
        match self.next_write {
            Some(deadline) => deadline
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::ZERO)
                .min(POLL_INTERVAL),
            None => Duration::ZERO,
        }
    }

    fn handle_readable(&mut self) -> bool {
        let mut buf = vec![0u8; self.read_mtu];
        let (len, arrival) = match recv_with_timestamp(self.fd.0, &mut buf, &self.timing) {
            Ok(Some(result)) => result,
            Ok(None) => return true,
            Err(err) => {
                warn!(error = %err, "stream read failed");
                let _ = self.events.send(StreamEvent::IoFailed);
                return false;
            }
        };
        buf.truncate(len);

        let pcm = if let Some(source) = &mut self.source {
            match source.depacketize(&buf) {
                Ok(pcm) => pcm,
                Err(err) => {
                    debug!(error = %err, "discarding undecodable packet");
                    return true;
                }
            }
        } else {
            match self.sco.accept(&buf) {
                Some(pcm) => pcm.to_vec(),
                None => {
                    debug!(len = buf.len(), "discarding misaligned SCO packet");
                    return true;
                }
            }
        };

        self.timing.record_arrival(pcm.len() as u64, arrival);
        // A full capture channel drops the oldest data silently; the
        // consumer is too slow to care about it anyway.
        let _ = self.pcm_out.try_send(pcm);

        // SCO writes are paced by reads while capture runs.
        if !self.profile.uses_rtp() && self.playback_running {
            self.next_write = Some(Instant::now());
        }
        true
    }

    fn handle_writes(&mut self) -> bool {
        // Read-paced SCO streams only write when a read released them.
        if !self.profile.uses_rtp() && self.record_running {
            match self.next_write {
                Some(deadline) if deadline <= Instant::now() => {}
                _ => return true,
            }
        } else if let Some(deadline) = self.next_write {
            let now = Instant::now();
            if deadline > now {
                return true;
            }
            if now.duration_since(deadline) > MAX_PLAYBACK_CATCH_UP {
                // Too far behind to catch up smoothly; skip ahead.
                warn!("playback fell behind real time; skipping ahead");
                self.next_write = Some(now);
                self.reduce_quality();
            }
        }

        let packet = if let Some(sink) = &mut self.sink {
            match sink.next_packet() {
                Ok(packet) => packet,
                Err(err) => {
                    warn!(error = %err, "encoding failed");
                    let _ = self.events.send(StreamEvent::IoFailed);
                    return false;
                }
            }
        } else {
            self.sco_next_packet()
        };
        let Some(packet) = packet else {
            return true;
        };

        match write_all(self.fd.0, &packet) {
            Ok(()) => {
                self.congestion = 0;
                self.advance_write_deadline(&packet);
            }
            Err(WriteOutcome::WouldBlock) => {
                // The packet is not replayed; the PCM clock moves on, as
                // it would on a lossy audio link.
                self.write_blocked = true;
                self.congestion += 1;
                if self.congestion >= CONGESTION_THRESHOLD {
                    self.congestion = 0;
                    self.reduce_quality();
                }
            }
            Err(WriteOutcome::Fatal(err)) => {
                warn!(error = %err, "stream write failed");
                let _ = self.events.send(StreamEvent::IoFailed);
                return false;
            }
        }
        true
    }

    fn advance_write_deadline(&mut self, packet: &[u8]) {
        let pcm_bytes = if let Some(sink) = &self.sink {
            // Timestamp delta equals the PCM the packet carried.
            sink.block_size() as u64
        } else {
            packet.len() as u64
        };
        let step = self.spec.bytes_to_duration(pcm_bytes);
        let base = self.next_write.unwrap_or_else(Instant::now);
        self.next_write = Some(base + step);
    }

    /// Step the encoder quality down one notch and tell the owner.
    /// Falling behind real time and link congestion both land here; SCO
    /// links have no quality knob, so this is a no-op for them.
    fn reduce_quality(&mut self) {
        if let Some(sink) = &mut self.sink {
            if let Some(bitpool) = sink.reduce_bitpool() {
                info!(bitpool, "reducing bitpool");
                let _ = self.events.send(StreamEvent::BitpoolChanged(bitpool));
            }
        }
    }

    // SCO pending buffer lives on the engine; the pipeline itself is
    // stateless.
    fn sco_feed(&mut self, pcm: &[u8]) -> usize {
        self.sco_pending.extend_from_slice(pcm);
        let max = self.spec.duration_to_bytes(MAX_PLAYBACK_CATCH_UP) as usize;
        if self.sco_pending.len() <= max {
            return 0;
        }
        let mut excess = self.sco_pending.len() - max;
        excess -= excess % self.spec.frame_size();
        self.sco_pending.drain(..excess);
        excess
    }

    fn sco_next_packet(&mut self) -> Option<Vec<u8>> {
        if self.sco_pending.len() < self.write_mtu {
            return None;
        }
        Some(self.sco_pending.drain(..self.write_mtu).collect())
    }
}

enum WriteOutcome {
    WouldBlock,
    Fatal(std::io::Error),
}

fn write_all(fd: RawFd, packet: &[u8]) -> Result<(), WriteOutcome> {
    loop {
        let rc = unsafe { libc::send(fd, packet.as_ptr().cast(), packet.len(), libc::MSG_NOSIGNAL) };
        if rc >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::Interrupted => continue,
            std::io::ErrorKind::WouldBlock => return Err(WriteOutcome::WouldBlock),
            _ => return Err(WriteOutcome::Fatal(err)),
        }
    }
}

/// Read one packet, preferring the kernel's arrival timestamp over the
/// monotonic clock.
fn recv_with_timestamp(
    fd: RawFd,
    buf: &mut [u8],
    timing: &StreamTiming,
) -> std::io::Result<Option<(usize, Duration)>> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut cmsg_space = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_space.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space.len();

    let rc = loop {
        let rc = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if rc >= 0 {
            break rc;
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::Interrupted => continue,
            std::io::ErrorKind::WouldBlock => return Ok(None),
            _ => return Err(err),
        }
    };

    let arrival = wall_timestamp(&msg)
        .and_then(|wall| monotonic_from_wall(wall, timing))
        .unwrap_or_else(|| timing.now());
    Ok(Some((rc as usize, arrival)))
}

/// Extract an `SO_TIMESTAMP` control message, if the kernel supplied one.
fn wall_timestamp(msg: &libc::msghdr) -> Option<libc::timeval> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_TIMESTAMP {
                let mut tv: libc::timeval = std::mem::zeroed();
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    (&mut tv as *mut libc::timeval).cast(),
                    std::mem::size_of::<libc::timeval>(),
                );
                return Some(tv);
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

/// Map a wall-clock arrival time into the engine's monotonic domain.
fn monotonic_from_wall(wall: libc::timeval, timing: &StreamTiming) -> Option<Duration> {
    let mut now_wall: libc::timeval = unsafe { std::mem::zeroed() };
    if unsafe { libc::gettimeofday(&mut now_wall, std::ptr::null_mut()) } != 0 {
        return None;
    }
    let to_micros =
        |tv: libc::timeval| tv.tv_sec as i64 * 1_000_000 + tv.tv_usec as i64;
    let age = to_micros(now_wall) - to_micros(wall);
    if age < 0 {
        return None;
    }
    timing
        .now()
        .checked_sub(Duration::from_micros(age as u64))
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn enable_rx_timestamps(fd: RawFd) -> std::io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMP,
            (&on as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
