// SPDX-License-Identifier: GPL-3.0-only

//! Multi-camera engine
//!
//! Opens every camera of the composed stream set directly, aligns their frames
//! by kernel timestamp and forwards each aligned set as one unit. Two worker
//! threads are involved:
//!
//! ```text
//! capture thread ──► Handoff (bounded, drop-oldest) ──► transmit thread ──► sink
//! ```
//!
//! The first stream of the set (the leader's) decides where sets go: its UDP
//! endpoints, or a `.mjpegset` recording file.

use super::gstreamer::unique_recording_path;
use super::rtp::{SetPacketizer, build_set_payload, wallclock_timestamp};
use super::types::{StreamConfig, StreamKind};
use super::{EngineOptions, ErrorCallback, StreamEngine};
use crate::backends::camera::{
    CaptureSettings, Frame, FrameSource, LoopAction, LoopController, SynchronizedCamera,
    V4l2Capture,
};
use crate::constants::{
    SYNC_RTP_PAYLOAD_TYPE, SYNC_RTP_SSRC, THREAD_JOIN_TIMEOUT, sync_threshold_us,
};
use crate::errors::{AppError, AppResult};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Idle wait of the capture loop after a cycle without an aligned set
const CAPTURE_IDLE: Duration = Duration::from_millis(10);

/// How long the transmit loop waits for a set before re-checking its stop flag
const TRANSMIT_POLL: Duration = Duration::from_millis(50);

/// Bounded set queue between the capture and transmit threads
pub struct Handoff {
    queue: Mutex<VecDeque<Vec<Frame>>>,
    ready: Condvar,
    capacity: usize,
}

impl Handoff {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Queue a set; returns `true` if the oldest queued set was dropped
    pub fn push(&self, set: Vec<Frame>) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let dropped = if queue.len() >= self.capacity {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(set);
        self.ready.notify_one();
        dropped
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<Vec<Frame>> {
        let queue = self.queue.lock().unwrap();
        let (mut queue, _) = self
            .ready
            .wait_timeout_while(queue, timeout, |queue| queue.is_empty())
            .unwrap();
        queue.pop_front()
    }

    /// Wake a waiting consumer so it can observe a stop request
    pub fn wake(&self) {
        self.ready.notify_all();
    }
}

/// Destination of aligned sets
pub enum SetSink {
    Network {
        socket: UdpSocket,
        targets: Vec<SocketAddr>,
        packetizer: SetPacketizer,
    },
    Recording {
        writer: BufWriter<File>,
        path: PathBuf,
    },
    /// Network stream without endpoints
    Discard,
}

impl SetSink {
    /// Sink for the leader stream of a composed set
    pub fn for_stream(stream: &StreamConfig, options: &EngineOptions) -> AppResult<Self> {
        match stream.kind {
            StreamKind::Recording => {
                std::fs::create_dir_all(&options.recordings_dir)?;
                let timestamp = chrono::Local::now().format("%F-%T").to_string();
                let path = unique_recording_path(
                    &options.recordings_dir,
                    stream.node_name(),
                    &timestamp,
                    "mjpegset",
                );
                let file = File::create(&path)?;
                info!(path = %path.display(), "Recording synchronized sets");
                Ok(SetSink::Recording {
                    writer: BufWriter::new(file),
                    path,
                })
            }
            StreamKind::Udp => {
                let targets: Vec<SocketAddr> = stream
                    .endpoints
                    .iter()
                    .filter_map(|endpoint| {
                        match (endpoint.host.as_str(), endpoint.port).to_socket_addrs() {
                            Ok(mut addrs) => addrs.next(),
                            Err(e) => {
                                warn!(endpoint = %endpoint, error = %e, "Unresolvable endpoint");
                                None
                            }
                        }
                    })
                    .collect();

                if targets.is_empty() {
                    debug!("No endpoints, synchronized sets will be discarded");
                    return Ok(SetSink::Discard);
                }

                let socket = UdpSocket::bind(("0.0.0.0", 0))?;
                Ok(SetSink::Network {
                    socket,
                    targets,
                    packetizer: SetPacketizer::new(SYNC_RTP_PAYLOAD_TYPE, SYNC_RTP_SSRC, options.mtu),
                })
            }
        }
    }

    /// Deliver one aligned set
    ///
    /// Network send failures are logged and skipped; recording write failures
    /// are returned.
    pub fn write_set(&mut self, set: &[Frame]) -> std::io::Result<()> {
        match self {
            SetSink::Network {
                socket,
                targets,
                packetizer,
            } => {
                let payload = build_set_payload(set);
                let packets = packetizer.packetize(&payload, wallclock_timestamp());
                for target in targets.iter() {
                    for packet in &packets {
                        if let Err(e) = socket.send_to(packet, target) {
                            debug!(%target, error = %e, "Dropped synchronized fragment");
                            break;
                        }
                    }
                }
                Ok(())
            }
            SetSink::Recording { writer, .. } => {
                let payload = build_set_payload(set);
                writer.write_all(&(payload.len() as u32).to_le_bytes())?;
                writer.write_all(&payload)
            }
            SetSink::Discard => Ok(()),
        }
    }

    pub fn recording_path(&self) -> Option<&PathBuf> {
        match self {
            SetSink::Recording { path, .. } => Some(path),
            _ => None,
        }
    }
}

pub struct SynchronizedEngine {
    streams: Vec<StreamConfig>,
    options: Arc<EngineOptions>,
    on_error: ErrorCallback,
    started: Arc<AtomicBool>,
    handoff: Arc<Handoff>,
    capture: Option<LoopController>,
    transmit: Option<LoopController>,
}

impl SynchronizedEngine {
    pub fn new(streams: Vec<StreamConfig>, options: Arc<EngineOptions>, on_error: ErrorCallback) -> Self {
        let handoff = Arc::new(Handoff::new(options.sync_queue_capacity));
        Self {
            streams,
            options,
            on_error,
            started: Arc::new(AtomicBool::new(false)),
            handoff,
            capture: None,
            transmit: None,
        }
    }

    fn open_sources(&self) -> AppResult<Vec<Box<dyn FrameSource>>> {
        let leader = &self.streams[0];
        let settings = CaptureSettings {
            width: leader.width,
            height: leader.height,
            fps: leader.interval.fps(),
            buffer_count: self.options.capture_buffers,
        };

        let mut sources: Vec<Box<dyn FrameSource>> = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            match V4l2Capture::open(&stream.device_path, &settings) {
                Ok(capture) => sources.push(Box::new(capture)),
                Err(e) => {
                    error!(device = %stream.device_path, error = %e, "Unable to open synchronized camera");
                    return Err(e.into());
                }
            }
        }
        Ok(sources)
    }

    /// Start the worker threads over already opened sources
    pub fn start_with_sources(&mut self, sources: Vec<Box<dyn FrameSource>>) -> AppResult<()> {
        let Some(leader) = self.streams.first() else {
            return Err(AppError::InvalidArgument("No streams to synchronize".to_string()));
        };

        let threshold = sync_threshold_us(leader.interval.fps());
        // A stop lands between sources, so a single grab must fit the join budget
        let grab_timeout = self.options.grab_timeout.min(THREAD_JOIN_TIMEOUT / 2);
        let capture_stop = Arc::new(AtomicBool::new(false));
        let mut camera = SynchronizedCamera::new(
            sources,
            self.options.sync_queue_capacity,
            threshold,
            grab_timeout,
        )
        .with_stop_signal(Arc::clone(&capture_stop));
        let mut sink = SetSink::for_stream(leader, &self.options)?;

        info!(
            devices = ?camera.labels(),
            threshold_us = threshold,
            "Starting synchronized stream"
        );

        self.started.store(true, Ordering::SeqCst);

        let handoff = Arc::clone(&self.handoff);
        self.capture = Some(LoopController::with_signal("sync-capture", capture_stop, move || {
            match camera.grab_synced() {
                Some(set) => {
                    if handoff.push(set) {
                        debug!("Transmit lagging, dropped oldest set");
                    }
                }
                None => thread::sleep(CAPTURE_IDLE),
            }
            LoopAction::Continue
        }));

        let handoff = Arc::clone(&self.handoff);
        let started = Arc::clone(&self.started);
        let on_error = Arc::clone(&self.on_error);
        self.transmit = Some(LoopController::start("sync-transmit", move || {
            let Some(set) = handoff.pop_timeout(TRANSMIT_POLL) else {
                return LoopAction::Continue;
            };
            if let Err(e) = sink.write_set(&set) {
                error!(error = %e, path = ?sink.recording_path(), "Failed to write synchronized set");
                if started.swap(false, Ordering::SeqCst) {
                    on_error(format!("Failed to write synchronized set: {}", e));
                }
                return LoopAction::Stop;
            }
            LoopAction::Continue
        }));

        Ok(())
    }
}

impl StreamEngine for SynchronizedEngine {
    fn start(&mut self) -> AppResult<()> {
        if self.capture.is_some() || self.transmit.is_some() {
            self.stop();
        }
        if self.streams.len() < 2 {
            return Err(AppError::InvalidArgument(
                "Synchronized capture needs at least two streams".to_string(),
            ));
        }

        let sources = self.open_sources()?;
        self.start_with_sources(sources)
    }

    fn stop(&mut self) {
        self.started.store(false, Ordering::SeqCst);
        self.handoff.wake();

        for mut worker in [self.capture.take(), self.transmit.take()].into_iter().flatten() {
            worker.stop_within(THREAD_JOIN_TIMEOUT);
        }
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && self.capture.as_ref().is_some_and(LoopController::is_running)
    }
}

impl Drop for SynchronizedEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::PixelFormat;
    use crate::pipelines::stream::types::{EncodeType, Interval, StreamEndpoint};
    use std::time::Instant;

    fn frame(ts: u64, data: &[u8]) -> Frame {
        Frame {
            data: data.to_vec(),
            width: 2,
            height: 2,
            pixel_format: PixelFormat::MJPG,
            timestamp_us: ts,
        }
    }

    /// Endless source producing frames one frame period apart
    struct TickingSource {
        label: String,
        next_ts: u64,
        payload: Vec<u8>,
    }

    impl FrameSource for TickingSource {
        fn grab(&mut self, _timeout: Duration) -> Option<Frame> {
            thread::sleep(Duration::from_millis(2));
            let ts = self.next_ts;
            self.next_ts += 16_667;
            Some(frame(ts, &self.payload))
        }

        fn label(&self) -> &str {
            &self.label
        }
    }

    /// Delivers each frame only once the whole grab timeout has passed
    struct SlowSource {
        label: String,
        next_ts: u64,
    }

    impl FrameSource for SlowSource {
        fn grab(&mut self, timeout: Duration) -> Option<Frame> {
            thread::sleep(timeout);
            let ts = self.next_ts;
            self.next_ts += 16_667;
            Some(frame(ts, b"s"))
        }

        fn label(&self) -> &str {
            &self.label
        }
    }

    fn options(dir: PathBuf) -> Arc<EngineOptions> {
        Arc::new(EngineOptions {
            pipeline_program: "true".to_string(),
            pipeline_args: Vec::new(),
            recordings_dir: dir,
            capture_buffers: 4,
            sync_queue_capacity: 8,
            grab_timeout: Duration::from_millis(100),
            mtu: 1400,
            restart_settle: Duration::ZERO,
        })
    }

    fn stream(path: &str, kind: StreamKind, endpoints: Vec<StreamEndpoint>) -> StreamConfig {
        StreamConfig {
            device_path: path.to_string(),
            encode_type: EncodeType::Mjpg,
            kind,
            endpoints,
            width: 1280,
            height: 720,
            interval: Interval {
                numerator: 1,
                denominator: 60,
            },
            enabled: true,
            software_h264_bitrate: 5000,
        }
    }

    fn ticking(label: &str, start: u64, payload: &[u8]) -> Box<dyn FrameSource> {
        Box::new(TickingSource {
            label: label.to_string(),
            next_ts: start,
            payload: payload.to_vec(),
        })
    }

    #[test]
    fn test_handoff_drops_oldest_when_full() {
        let handoff = Handoff::new(2);
        assert!(!handoff.push(vec![frame(1, b"a")]));
        assert!(!handoff.push(vec![frame(2, b"b")]));
        assert!(handoff.push(vec![frame(3, b"c")]));

        let first = handoff.pop_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(first[0].timestamp_us, 2);
        let second = handoff.pop_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(second[0].timestamp_us, 3);
        assert!(handoff.pop_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_handoff_pop_times_out_when_empty() {
        let handoff = Handoff::new(2);
        let started = Instant::now();
        assert!(handoff.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_open_failure_is_reported_as_capture_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = SynchronizedEngine::new(
            vec![
                stream("/dev/camrig-missing-a", StreamKind::Udp, Vec::new()),
                stream("/dev/camrig-missing-b", StreamKind::Udp, Vec::new()),
            ],
            options(dir.path().to_path_buf()),
            Arc::new(|_| {}),
        );
        assert!(matches!(engine.start(), Err(AppError::CaptureOpen { .. })));
        assert!(!engine.is_started());
    }

    #[test]
    fn test_sets_reach_udp_endpoint() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let dir = tempfile::tempdir().unwrap();
        let endpoint = StreamEndpoint {
            host: "127.0.0.1".to_string(),
            port,
        };
        let mut engine = SynchronizedEngine::new(
            vec![
                stream("/dev/video0", StreamKind::Udp, vec![endpoint]),
                stream("/dev/video2", StreamKind::Udp, Vec::new()),
            ],
            options(dir.path().to_path_buf()),
            Arc::new(|_| {}),
        );
        engine
            .start_with_sources(vec![ticking("a", 1000, b"left"), ticking("b", 1005, b"right")])
            .unwrap();

        let mut buffer = [0u8; 2048];
        let received = receiver.recv(&mut buffer).unwrap();
        engine.stop();

        // Single-fragment set: marker set, 16-byte length header, both frames
        assert_eq!(received, 12 + 16 + 9);
        assert_ne!(buffer[1] & 0x80, 0);
        assert_eq!(&buffer[12..20], &4u64.to_le_bytes());
        assert_eq!(&buffer[20..28], &5u64.to_le_bytes());
        assert_eq!(&buffer[28..37], b"leftright");
        assert!(!engine.is_started());
    }

    #[test]
    fn test_recording_writes_length_prefixed_sets() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = SynchronizedEngine::new(
            vec![
                stream("/dev/video0", StreamKind::Recording, Vec::new()),
                stream("/dev/video2", StreamKind::Recording, Vec::new()),
            ],
            options(dir.path().to_path_buf()),
            Arc::new(|_| {}),
        );
        engine
            .start_with_sources(vec![ticking("a", 0, b"L"), ticking("b", 3, b"R")])
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        engine.stop();

        let entry = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .find(|e| e.path().extension().is_some_and(|ext| ext == "mjpegset"))
            .expect("recording file");
        let bytes = std::fs::read(entry.path()).unwrap();

        // u32 length, then 16-byte header plus one byte per frame
        assert!(bytes.len() >= 4 + 18);
        assert_eq!(&bytes[0..4], &18u32.to_le_bytes());
        assert_eq!(&bytes[20..22], b"LR");
        assert_eq!(bytes.len() % 22, 0);
    }

    #[test]
    fn test_stop_is_not_held_up_by_slow_cameras() {
        let dir = tempfile::tempdir().unwrap();
        let mut slow = (*options(dir.path().to_path_buf())).clone();
        slow.grab_timeout = Duration::from_secs(1);
        let mut engine = SynchronizedEngine::new(
            (0..4)
                .map(|i| stream(&format!("/dev/video{}", i * 2), StreamKind::Udp, Vec::new()))
                .collect(),
            Arc::new(slow),
            Arc::new(|_| {}),
        );
        let sources = (0..4)
            .map(|i| {
                Box::new(SlowSource {
                    label: format!("cam{}", i),
                    next_ts: i,
                }) as Box<dyn FrameSource>
            })
            .collect();
        engine.start_with_sources(sources).unwrap();
        assert!(engine.is_started());
        thread::sleep(Duration::from_millis(50));

        // A full cycle would take four seconds and outlast the join timeout
        let started = Instant::now();
        engine.stop();
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert!(!engine.is_started());
    }
}
