// SPDX-License-Identifier: GPL-3.0-only

//! Raw V4L2 frame capture
//!
//! [`V4l2Capture`] opens one camera node, negotiates MJPEG at a fixed size and
//! frame rate, maps a small arena of kernel buffers and hands out owned copies
//! of dequeued frames. Each buffer is held only while its bytes are copied out
//! and is queued back to the driver before `grab` returns.
//!
//! Format and frame-rate negotiation go through the `v4l` crate; buffer
//! management uses the raw ioctls so the dequeue can be non-blocking and the
//! kernel timestamp is available.

use super::types::{CaptureError, CaptureResult, Frame, PixelFormat};
use crate::constants::GRAB_RETRY_INTERVAL;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use v4l::parameters::Capabilities as ParamCapabilities;
use v4l::video::Capture;
use v4l::video::capture::Parameters;
use v4l::{Format, FourCC};

/// Anything that yields timestamped frames
///
/// Implemented by [`V4l2Capture`]; the synchronizer only depends on this.
pub trait FrameSource: Send {
    /// Wait up to `timeout` for the next frame
    fn grab(&mut self, timeout: Duration) -> Option<Frame>;

    /// Node path (or another label) used in logs
    fn label(&self) -> &str;
}

/// Requested capture parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
}

// ===== ioctl plumbing =====

const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_MEMORY_MMAP: u32 = 1;

const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((b'V' as libc::c_ulong) << 8) | nr
}

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ_WRITE: libc::c_ulong = 3;

const VIDIOC_REQBUFS: libc::c_ulong =
    ioc(IOC_READ_WRITE, 8, std::mem::size_of::<V4l2RequestBuffers>());
const VIDIOC_QUERYBUF: libc::c_ulong = ioc(IOC_READ_WRITE, 9, std::mem::size_of::<V4l2Buffer>());
const VIDIOC_QBUF: libc::c_ulong = ioc(IOC_READ_WRITE, 15, std::mem::size_of::<V4l2Buffer>());
const VIDIOC_DQBUF: libc::c_ulong = ioc(IOC_READ_WRITE, 17, std::mem::size_of::<V4l2Buffer>());
const VIDIOC_STREAMON: libc::c_ulong = ioc(IOC_WRITE, 18, std::mem::size_of::<libc::c_int>());
const VIDIOC_STREAMOFF: libc::c_ulong = ioc(IOC_WRITE, 19, std::mem::size_of::<libc::c_int>());

#[repr(C)]
struct V4l2RequestBuffers {
    count: u32,
    buf_type: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Timecode {
    tc_type: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
union V4l2BufferLocation {
    offset: u32,
    userptr: libc::c_ulong,
    fd: i32,
}

#[repr(C)]
struct V4l2Buffer {
    index: u32,
    buf_type: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: V4l2Timecode,
    sequence: u32,
    memory: u32,
    m: V4l2BufferLocation,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

impl V4l2Buffer {
    fn mmap_slot(index: u32) -> Self {
        let mut buf: V4l2Buffer = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = V4L2_MEMORY_MMAP;
        buf
    }

    fn timestamp_us(&self) -> u64 {
        let sec = self.timestamp.tv_sec.max(0) as u64;
        let usec = self.timestamp.tv_usec.max(0) as u64;
        sec * 1_000_000 + usec
    }
}

fn xioctl<T>(fd: RawFd, request: libc::c_ulong, arg: &mut T) -> std::io::Result<()> {
    loop {
        let result = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if result >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

// ===== Buffer arena =====

struct MappedSlot {
    ptr: *mut u8,
    len: usize,
}

/// Fixed set of kernel buffers mapped into this process, indexed by slot id
struct BufferArena {
    slots: Vec<MappedSlot>,
}

// The mappings are only touched through `&mut V4l2Capture`.
unsafe impl Send for BufferArena {}

impl BufferArena {
    fn map(fd: RawFd, count: u32) -> std::io::Result<Self> {
        let mut request = V4l2RequestBuffers {
            count,
            buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: V4L2_MEMORY_MMAP,
            capabilities: 0,
            flags: 0,
            reserved: [0; 3],
        };
        xioctl(fd, VIDIOC_REQBUFS, &mut request)?;
        if request.count == 0 {
            return Err(std::io::Error::other("driver granted no buffers"));
        }

        let mut arena = BufferArena {
            slots: Vec::with_capacity(request.count as usize),
        };

        for index in 0..request.count {
            let mut buf = V4l2Buffer::mmap_slot(index);
            xioctl(fd, VIDIOC_QUERYBUF, &mut buf)?;

            let len = buf.length as usize;
            let offset = unsafe { buf.m.offset } as libc::off_t;
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    offset,
                )
            };
            if ptr == libc::MAP_FAILED {
                // Already-mapped slots are released by Drop
                return Err(std::io::Error::last_os_error());
            }
            arena.slots.push(MappedSlot {
                ptr: ptr as *mut u8,
                len,
            });
        }

        Ok(arena)
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Copy `used` bytes out of a slot
    fn copy_out(&self, index: usize, used: usize) -> Option<Vec<u8>> {
        let slot = self.slots.get(index)?;
        let used = used.min(slot.len);
        let bytes = unsafe { std::slice::from_raw_parts(slot.ptr, used) };
        Some(bytes.to_vec())
    }
}

impl Drop for BufferArena {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            unsafe {
                libc::munmap(slot.ptr as *mut libc::c_void, slot.len);
            }
        }
    }
}

// ===== Capture unit =====

/// One streaming MJPEG camera node
pub struct V4l2Capture {
    path: String,
    width: u32,
    height: u32,
    streaming: bool,
    // Declared before `device` so the mappings are released before the fd closes
    arena: BufferArena,
    device: v4l::Device,
}

impl V4l2Capture {
    /// Open a node and start streaming
    pub fn open(path: &str, settings: &CaptureSettings) -> CaptureResult<Self> {
        let err = |reason: String| CaptureError::Open {
            path: path.to_string(),
            reason,
        };

        let device = v4l::Device::with_path(path).map_err(|e| err(e.to_string()))?;
        let fd = device.handle().fd();
        set_nonblocking(fd).map_err(|e| err(e.to_string()))?;

        let mjpg = FourCC::new(b"MJPG");
        let requested = Format::new(settings.width, settings.height, mjpg);
        let actual = device
            .set_format(&requested)
            .map_err(|e| CaptureError::Format {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        if actual.fourcc != mjpg || actual.width != settings.width || actual.height != settings.height
        {
            return Err(CaptureError::Format {
                path: path.to_string(),
                reason: format!(
                    "requested MJPG {}x{}, driver chose {} {}x{}",
                    settings.width, settings.height, actual.fourcc, actual.width, actual.height
                ),
            });
        }

        let params = device.params().map_err(|e| CaptureError::FrameRate {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        if !params.capabilities.contains(ParamCapabilities::TIME_PER_FRAME) {
            return Err(CaptureError::FrameRate {
                path: path.to_string(),
                reason: "driver does not support frame interval selection".to_string(),
            });
        }
        let applied = device
            .set_params(&Parameters::with_fps(settings.fps))
            .map_err(|e| CaptureError::FrameRate {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        debug!(
            device = %path,
            numerator = applied.interval.numerator,
            denominator = applied.interval.denominator,
            "Frame interval applied"
        );

        let arena =
            BufferArena::map(fd, settings.buffer_count).map_err(|e| CaptureError::Buffers {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        let mut capture = V4l2Capture {
            path: path.to_string(),
            width: settings.width,
            height: settings.height,
            streaming: false,
            arena,
            device,
        };

        for index in 0..capture.arena.len() as u32 {
            capture
                .queue(index)
                .map_err(|e| CaptureError::Buffers {
                    path: path.to_string(),
                    reason: e.to_string(),
                })?;
        }

        let mut buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        xioctl(capture.fd(), VIDIOC_STREAMON, &mut buf_type).map_err(|e| {
            CaptureError::Stream {
                path: path.to_string(),
                reason: e.to_string(),
            }
        })?;
        capture.streaming = true;

        info!(
            device = %path,
            width = settings.width,
            height = settings.height,
            fps = settings.fps,
            buffers = capture.arena.len(),
            "Capture started"
        );
        Ok(capture)
    }

    fn fd(&self) -> RawFd {
        self.device.handle().fd()
    }

    fn queue(&mut self, index: u32) -> std::io::Result<()> {
        let mut buf = V4l2Buffer::mmap_slot(index);
        xioctl(self.fd(), VIDIOC_QBUF, &mut buf)
    }

    /// Dequeue one ready buffer; `Ok(None)` when nothing is ready yet
    fn dequeue(&mut self) -> std::io::Result<Option<V4l2Buffer>> {
        let mut buf = V4l2Buffer::mmap_slot(0);
        match xioctl(self.fd(), VIDIOC_DQBUF, &mut buf) {
            Ok(()) => Ok(Some(buf)),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stream_off(&mut self) {
        if !self.streaming {
            return;
        }
        let mut buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        if let Err(e) = xioctl(self.fd(), VIDIOC_STREAMOFF, &mut buf_type) {
            warn!(device = %self.path, error = %e, "STREAMOFF failed");
        }
        self.streaming = false;
    }
}

impl FrameSource for V4l2Capture {
    fn grab(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.dequeue() {
                Ok(Some(buf)) => {
                    let data = self.arena.copy_out(buf.index as usize, buf.bytesused as usize);
                    let timestamp_us = buf.timestamp_us();

                    if let Err(e) = self.queue(buf.index) {
                        warn!(device = %self.path, index = buf.index, error = %e, "Failed to requeue buffer");
                    }

                    return data.map(|data| Frame {
                        data,
                        width: self.width,
                        height: self.height,
                        pixel_format: PixelFormat::MJPG,
                        timestamp_us,
                    });
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        debug!(device = %self.path, "Grab timed out");
                        return None;
                    }
                    std::thread::sleep(GRAB_RETRY_INTERVAL);
                }
                Err(e) => {
                    warn!(device = %self.path, error = %e, "Dequeue failed");
                    return None;
                }
            }
        }
    }

    fn label(&self) -> &str {
        &self.path
    }
}

impl Drop for V4l2Capture {
    fn drop(&mut self) {
        self.stream_off();
        debug!(device = %self.path, "Capture closed");
    }
}
