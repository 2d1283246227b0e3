//! Rolling audio buffer and PCM frame validation.
//!
//! Each participant keeps the last few seconds of raw microphone PCM for
//! the emotion analyzer. Frames on the wire are 16 kHz mono 16-bit
//! little-endian PCM, at most ~100 ms each.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bytes per second of 16 kHz mono PCM16LE.
pub const BYTES_PER_SECOND: usize = 16_000 * 2;

/// Nominal upper bound for one frame (~100 ms).
pub const MAX_FRAME_BYTES: usize = BYTES_PER_SECOND / 10;

/// Retention window for the rolling buffer.
pub const BUFFER_WINDOW: Duration = Duration::from_secs(5);

/// Check an inbound audio frame. PCM16 frames must contain whole
/// samples; anything else is dropped by the transport with a warning.
pub fn validate_frame(bytes: &[u8]) -> Result<(), &'static str> {
    if bytes.is_empty() {
        return Err("empty audio frame");
    }
    if bytes.len() % 2 != 0 {
        return Err("audio frame length is not a multiple of 2");
    }
    Ok(())
}

/// Last ≤ 5 s of raw PCM with per-frame timestamps. Evicts by age and by
/// byte budget so a burst of oversized frames cannot grow it unbounded.
#[derive(Debug, Default)]
pub struct RollingAudioBuffer {
    frames: VecDeque<(Instant, Vec<u8>)>,
    total_bytes: usize,
}

impl RollingAudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame and evict anything older than the window.
    pub fn push(&mut self, frame: Vec<u8>) {
        self.total_bytes += frame.len();
        self.frames.push_back((Instant::now(), frame));
        self.evict();
    }

    fn evict(&mut self) {
        let cutoff = Instant::now().checked_sub(BUFFER_WINDOW);
        let byte_budget = BYTES_PER_SECOND * BUFFER_WINDOW.as_secs() as usize;
        while let Some((at, frame)) = self.frames.front() {
            if cutoff.is_some_and(|c| *at < c) || self.total_bytes > byte_budget {
                self.total_bytes -= frame.len();
                self.frames.pop_front();
            } else {
                break;
            }
        }
    }

    /// Concatenated snapshot of the retained audio, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for (_, frame) in &self.frames {
            out.extend_from_slice(frame);
        }
        out
    }

    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.total_bytes = 0;
    }
}
