// SPDX-License-Identifier: GPL-3.0-only

//! Single-camera engine backed by an external pipeline process
//!
//! The pipeline description is assembled from the stream config as launcher
//! arguments and handed to the launcher (`gst-launch-1.0` by default). The process's stderr is watched
//! by a monitor thread that collects error lines and reports a crash (non-zero
//! exit while the engine is started) through the error callback exactly once.

use super::types::{EncodeType, StreamConfig, StreamKind};
use super::{EngineOptions, ErrorCallback, StreamEngine};
use crate::constants::{
    REAP_POLL_INTERVAL, RECORDING_STOP_TIMEOUT, STREAM_STOP_TIMEOUT, THREAD_JOIN_TIMEOUT,
};
use crate::errors::{AppError, AppResult};
use std::io::{BufRead, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const ERROR_KEYWORDS: [&str; 4] = ["error", "failed", "warning", "critical"];

/// Driver assertion printed on every start by some V4L2 stacks; harmless
const BENIGN_DMA_ASSERTION: &str =
    "_dma_fmt_to_dma_drm_fmts: assertion 'fmt != GST_VIDEO_FORMAT_UNKNOWN' failed";

/// Muxer could not allocate its buffers; nothing useful was written
const ALLOCATION_FAILURE: &str = "Failed to allocate required memory";

/// Pipeline description for one stream plus the file it records to
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPipeline {
    /// One launcher argument per element, property or link; property values
    /// may contain spaces
    pub args: Vec<String>,
    pub recording_path: Option<PathBuf>,
}

impl BuiltPipeline {
    /// Single-line form for logs
    pub fn description(&self) -> String {
        self.args.join(" ")
    }
}

fn tokens(segment: &str) -> impl Iterator<Item = String> + '_ {
    segment.split_whitespace().map(str::to_string)
}

/// Builds pipeline descriptions from stream configs
pub struct PipelineBuilder;

impl PipelineBuilder {
    /// Build the description for `stream`
    ///
    /// # Arguments
    /// * `stream` - Stream to describe
    /// * `recordings_dir` - Created on demand when `stream` is a recording
    ///
    /// # Returns
    /// * `Ok(BuiltPipeline)` - Description and, for recordings, the output file
    /// * `Err(AppError::Io)` - Recordings directory could not be prepared
    pub fn build(stream: &StreamConfig, recordings_dir: &Path) -> AppResult<BuiltPipeline> {
        let mut args = vec![
            "v4l2src".to_string(),
            format!("device={}", stream.device_path),
            "!".to_string(),
            Self::caps(stream),
            "!".to_string(),
        ];
        args.extend(tokens(&Self::payload(stream)));
        args.push("!".to_string());

        let recording_path = match stream.kind {
            StreamKind::Udp => {
                args.extend(tokens(&Self::network_sink(stream)));
                None
            }
            StreamKind::Recording => {
                let path = prepare_recording_path(stream, recordings_dir)?;
                args.push("filesink".to_string());
                args.push(format!("location={}", path.display()));
                args.push("sync=true".to_string());
                Some(path)
            }
        };

        Ok(BuiltPipeline {
            args,
            recording_path,
        })
    }

    fn framerate(stream: &StreamConfig) -> String {
        format!(
            "framerate={}/{}",
            stream.interval.denominator, stream.interval.numerator
        )
    }

    fn caps(stream: &StreamConfig) -> String {
        let media_type = match stream.encode_type {
            EncodeType::H264 => "video/x-h264",
            // Software H.264 encodes from the camera's JPEG output
            EncodeType::Mjpg | EncodeType::SoftwareH264 => "image/jpeg",
        };
        format!(
            "{},width={},height={},{}",
            media_type,
            stream.width,
            stream.height,
            Self::framerate(stream)
        )
    }

    fn h264_recording_caps(stream: &StreamConfig) -> String {
        format!(
            "h264parse ! video/x-h264,width={},height={},{} ! queue ! mp4mux",
            stream.width,
            stream.height,
            Self::framerate(stream)
        )
    }

    fn payload(stream: &StreamConfig) -> String {
        let recording = stream.is_recording();
        match stream.encode_type {
            EncodeType::H264 if recording => Self::h264_recording_caps(stream),
            EncodeType::H264 => "h264parse ! queue ! rtph264pay config-interval=10 pt=96".to_string(),
            EncodeType::Mjpg if recording => "queue ! avimux".to_string(),
            EncodeType::Mjpg => "rtpjpegpay".to_string(),
            EncodeType::SoftwareH264 if recording => format!(
                "jpegdec ! queue ! x264enc byte-stream=false tune=zerolatency bitrate={} speed-preset=ultrafast ! {}",
                stream.software_h264_bitrate,
                Self::h264_recording_caps(stream)
            ),
            EncodeType::SoftwareH264 => format!(
                "jpegdec ! queue ! x264enc byte-stream=true tune=zerolatency bitrate={} speed-preset=ultrafast ! rtph264pay config-interval=10 pt=96",
                stream.software_h264_bitrate
            ),
        }
    }

    fn network_sink(stream: &StreamConfig) -> String {
        if stream.endpoints.is_empty() {
            return "fakesink".to_string();
        }
        let clients: Vec<String> = stream.endpoints.iter().map(|e| e.to_string()).collect();
        format!("multiudpsink sync=true clients={}", clients.join(","))
    }
}

/// Pick a recording file name that does not exist yet
///
/// `<node>_<timestamp>.<ext>`, or `<node>_<timestamp>_<pid>.<ext>` if taken.
pub fn unique_recording_path(dir: &Path, node: &str, timestamp: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{}_{}.{}", node, timestamp, extension));
    if !candidate.exists() {
        return candidate;
    }
    dir.join(format!(
        "{}_{}_{}.{}",
        node,
        timestamp,
        std::process::id(),
        extension
    ))
}

/// Create the recordings directory (mode 0755) and pick an output path
pub fn prepare_recording_path(stream: &StreamConfig, recordings_dir: &Path) -> AppResult<PathBuf> {
    std::fs::create_dir_all(recordings_dir)?;
    std::fs::set_permissions(recordings_dir, std::fs::Permissions::from_mode(0o755))?;

    let timestamp = chrono::Local::now().format("%F-%T").to_string();
    Ok(unique_recording_path(
        recordings_dir,
        stream.node_name(),
        &timestamp,
        stream.encode_type.recording_extension(),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineClass {
    Error,
    Benign,
    Info,
}

fn classify_line(line: &str) -> LineClass {
    let lower = line.to_lowercase();
    if !ERROR_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
        return LineClass::Info;
    }
    if line.contains(BENIGN_DMA_ASSERTION) {
        return LineClass::Benign;
    }
    LineClass::Error
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map_or(-1, |signal| -signal))
}

struct EngineShared {
    started: AtomicBool,
    child: Mutex<Option<Child>>,
    recording_paths: Mutex<Vec<PathBuf>>,
}

pub struct PipelineEngine {
    streams: Vec<StreamConfig>,
    options: Arc<EngineOptions>,
    on_error: ErrorCallback,
    shared: Arc<EngineShared>,
    monitor: Option<JoinHandle<()>>,
}

impl PipelineEngine {
    pub fn new(streams: Vec<StreamConfig>, options: Arc<EngineOptions>, on_error: ErrorCallback) -> Self {
        Self {
            streams,
            options,
            on_error,
            shared: Arc::new(EngineShared {
                started: AtomicBool::new(false),
                child: Mutex::new(None),
                recording_paths: Mutex::new(Vec::new()),
            }),
            monitor: None,
        }
    }

    fn has_recording(&self) -> bool {
        self.streams.iter().any(StreamConfig::is_recording)
    }

    /// Full launcher argument list for the current stream set
    fn command_args(&self) -> AppResult<(Vec<String>, Vec<PathBuf>)> {
        let mut args = self.options.pipeline_args.clone();
        if self.has_recording() {
            args.push("-e".to_string());
        }

        let mut recording_paths = Vec::new();
        for stream in &self.streams {
            let built = PipelineBuilder::build(stream, &self.options.recordings_dir)?;
            info!(pipeline = %built.description(), "Built pipeline");
            args.extend(built.args);
            recording_paths.extend(built.recording_path);
        }
        Ok((args, recording_paths))
    }

    fn join_monitor(&mut self) {
        let Some(handle) = self.monitor.take() else {
            return;
        };
        let deadline = Instant::now() + THREAD_JOIN_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("Pipeline monitor did not exit in time, detaching");
                return;
            }
            thread::sleep(REAP_POLL_INTERVAL);
        }
        if handle.join().is_err() {
            warn!("Pipeline monitor panicked");
        }
    }
}

impl StreamEngine for PipelineEngine {
    fn start(&mut self) -> AppResult<()> {
        if self.shared.started.load(Ordering::SeqCst) {
            self.stop();
        }

        let (args, recording_paths) = self.command_args()?;
        let mut child = Command::new(&self.options.pipeline_program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AppError::StreamProcess(format!(
                    "Failed to spawn {}: {}",
                    self.options.pipeline_program, e
                ))
            })?;

        let Some(stderr) = child.stderr.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AppError::StreamProcess("Pipeline stderr unavailable".to_string()));
        };

        info!(pid = child.id(), "Pipeline process started");
        *self.shared.recording_paths.lock().unwrap() = recording_paths;
        *self.shared.child.lock().unwrap() = Some(child);
        self.shared.started.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let on_error = Arc::clone(&self.on_error);
        let recording = self.has_recording();
        let monitor = thread::Builder::new()
            .name("pipeline-monitor".to_string())
            .spawn(move || monitor_process(stderr, shared, on_error, recording));

        match monitor {
            Ok(handle) => {
                self.monitor = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(AppError::StreamProcess(format!(
                    "Failed to spawn pipeline monitor: {}",
                    e
                )))
            }
        }
    }

    fn stop(&mut self) {
        self.shared.started.store(false, Ordering::SeqCst);

        let child = self.shared.child.lock().unwrap().take();
        if let Some(mut child) = child {
            let recording = self.has_recording();
            // SIGINT lets gst-launch send EOS so the muxer can finalise the file
            let (signal, timeout) = if recording {
                (libc::SIGINT, RECORDING_STOP_TIMEOUT)
            } else {
                (libc::SIGTERM, STREAM_STOP_TIMEOUT)
            };
            info!(pid = child.id(), recording, "Stopping pipeline process");
            terminate_child(&mut child, signal, timeout);
        }

        self.join_monitor();
    }

    fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }
}

impl Drop for PipelineEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Signal the child, wait up to `timeout`, then kill it
fn terminate_child(child: &mut Child, signal: libc::c_int, timeout: Duration) {
    let pid = child.id() as libc::pid_t;
    if unsafe { libc::kill(pid, signal) } != 0 {
        debug!(pid, "Signal delivery failed, process probably exited");
    }

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, code = exit_code(status), "Pipeline process exited");
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(REAP_POLL_INTERVAL),
            Ok(None) => {
                warn!(pid, ?timeout, "Shutdown timed out, force killing");
                break;
            }
            Err(e) => {
                error!(pid, error = %e, "Error while waiting for pipeline process");
                break;
            }
        }
    }

    let _ = child.kill();
    let _ = child.wait();
}

fn monitor_process(
    stderr: ChildStderr,
    shared: Arc<EngineShared>,
    on_error: ErrorCallback,
    recording: bool,
) {
    let mut error_block = Vec::new();

    for line in BufReader::new(stderr).lines() {
        let Ok(line) = line else {
            break;
        };
        let line = line.trim();
        match classify_line(line) {
            LineClass::Info => debug!(line, "Pipeline output"),
            LineClass::Benign => debug!(line, "Ignoring benign driver warning"),
            LineClass::Error => {
                warn!(line, "Pipeline reported a problem");
                if recording && line.contains(ALLOCATION_FAILURE) {
                    remove_recordings(&shared);
                }
                error_block.push(line.to_string());
            }
        }
    }

    // stderr closed: wait for the exit status unless stop() owns the child
    let status = loop {
        {
            let mut child = shared.child.lock().unwrap();
            let Some(process) = child.as_mut() else {
                return;
            };
            match process.try_wait() {
                Ok(Some(status)) => {
                    child.take();
                    break status;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Unable to reap pipeline process");
                    return;
                }
            }
        }
        thread::sleep(REAP_POLL_INTERVAL);
    };

    let code = exit_code(status);
    if code == 0 {
        info!("Pipeline process finished");
        shared.started.store(false, Ordering::SeqCst);
        return;
    }

    if shared.started.swap(false, Ordering::SeqCst) {
        error!(code, "Pipeline process crashed");
        for line in &error_block {
            error!(line = %line, "Pipeline error output");
        }
        on_error(format!("Process exited with code {}.", code));
    }
}

fn remove_recordings(shared: &EngineShared) {
    for path in shared.recording_paths.lock().unwrap().drain(..) {
        match std::fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "Removed unwritten recording"),
            Err(e) => debug!(path = %path.display(), error = %e, "Recording file not removed"),
        }
    }
}
