// SPDX-License-Identifier: GPL-3.0-only

//! Cross-camera frame alignment
//!
//! Every source gets a bounded FIFO. New frames push out the oldest entry when a
//! queue is full, so a fast camera is never held back by a slow one. A set is
//! emitted once the head timestamps of all queues lie within the sync
//! threshold; otherwise the single oldest head is discarded and the comparison
//! is retried.

use super::capture::FrameSource;
use super::types::Frame;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Timestamp-based aligner over N frame queues
#[derive(Debug)]
pub struct FrameAligner {
    queues: Vec<VecDeque<Frame>>,
    capacity: usize,
    threshold_us: u64,
    dropped: u64,
}

impl FrameAligner {
    pub fn new(sources: usize, capacity: usize, threshold_us: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            queues: (0..sources).map(|_| VecDeque::with_capacity(capacity)).collect(),
            capacity,
            threshold_us,
            dropped: 0,
        }
    }

    pub fn sources(&self) -> usize {
        self.queues.len()
    }

    pub fn threshold_us(&self) -> u64 {
        self.threshold_us
    }

    /// Frames currently waiting for `source`
    pub fn queued(&self, source: usize) -> usize {
        self.queues.get(source).map_or(0, VecDeque::len)
    }

    /// Timestamps currently waiting for `source`, oldest first
    pub fn queued_timestamps(&self, source: usize) -> Vec<u64> {
        self.queues
            .get(source)
            .map(|q| q.iter().map(|f| f.timestamp_us).collect())
            .unwrap_or_default()
    }

    /// Frames discarded so far (evictions plus laggard heads)
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append a frame, evicting the oldest one if the queue is full
    pub fn push(&mut self, source: usize, frame: Frame) {
        let Some(queue) = self.queues.get_mut(source) else {
            return;
        };
        queue.push_back(frame);
        while queue.len() > self.capacity {
            queue.pop_front();
            self.dropped += 1;
            trace!(source, "Evicted oldest queued frame");
        }
    }

    /// Pop one aligned set if the queue heads allow it
    pub fn try_align(&mut self) -> Option<Vec<Frame>> {
        if self.queues.is_empty() {
            return None;
        }

        while self.queues.iter().all(|q| !q.is_empty()) {
            let mut min = (0usize, u64::MAX);
            let mut max = u64::MIN;
            for (source, queue) in self.queues.iter().enumerate() {
                let ts = queue.front().map_or(0, |f| f.timestamp_us);
                if ts < min.1 {
                    min = (source, ts);
                }
                max = max.max(ts);
            }

            if max - min.1 <= self.threshold_us {
                return self.queues.iter_mut().map(VecDeque::pop_front).collect();
            }

            trace!(source = min.0, spread_us = max - min.1, "Discarding laggard head");
            self.queues[min.0].pop_front();
            self.dropped += 1;
        }

        None
    }
}

/// N frame sources combined into one synchronized source
pub struct SynchronizedCamera {
    sources: Vec<Box<dyn FrameSource>>,
    aligner: FrameAligner,
    grab_timeout: Duration,
    stop: Option<Arc<AtomicBool>>,
}

impl SynchronizedCamera {
    pub fn new(
        sources: Vec<Box<dyn FrameSource>>,
        capacity: usize,
        threshold_us: u64,
        grab_timeout: Duration,
    ) -> Self {
        debug!(
            sources = sources.len(),
            capacity, threshold_us, "Creating synchronized camera"
        );
        let aligner = FrameAligner::new(sources.len(), capacity, threshold_us);
        Self {
            sources,
            aligner,
            grab_timeout,
            stop: None,
        }
    }

    /// Abandon a capture cycle between sources once `stop` is raised
    ///
    /// Bounds how long a stalled rig keeps the capture thread busy to one
    /// grab timeout, however many sources there are.
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|stop| stop.load(Ordering::SeqCst))
    }

    /// Capture one frame per source and return an aligned set if one is ready
    ///
    /// Returns `None` when any source fails to deliver within the grab timeout
    /// or when alignment leaves a queue empty. A raised stop signal ends the
    /// cycle before the next source is polled.
    pub fn grab_synced(&mut self) -> Option<Vec<Frame>> {
        let mut captured = Vec::with_capacity(self.sources.len());
        for index in 0..self.sources.len() {
            if self.stop_requested() {
                debug!("Stop requested, abandoning capture cycle");
                return None;
            }
            let source = &mut self.sources[index];
            match source.grab(self.grab_timeout) {
                Some(frame) => captured.push(frame),
                None => {
                    debug!(source = %source.label(), "No frame this cycle");
                    return None;
                }
            }
        }

        for (index, frame) in captured.into_iter().enumerate() {
            self.aligner.push(index, frame);
        }
        self.aligner.try_align()
    }

    pub fn aligner(&self) -> &FrameAligner {
        &self.aligner
    }

    pub fn labels(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.label().to_string()).collect()
    }
}
