//! Microphone capture resampling.
//!
//! Converts float samples at the device's native rate into fixed-size
//! 16-bit PCM frames at the recognition rate. The browser runs the same
//! algorithm inside an `AudioWorklet`; native clients and tests use this type.

use parley_types::{BYTES_PER_SAMPLE, FRAME_SAMPLES, TARGET_SAMPLE_RATE};
use std::f32::consts::PI;

/// One frame of 16-bit mono PCM ready to send upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame(pub Vec<i16>);

impl PcmFrame {
    /// Little-endian byte encoding used on the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() * BYTES_PER_SAMPLE);
        for sample in &self.0 {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Single-pole low-pass filter followed by integer decimation.
#[derive(Debug, Clone)]
pub struct Downsampler {
    ratio: usize,
    alpha: f32,
    filtered: f32,
    phase: usize,
    frame_samples: usize,
    pending: Vec<i16>,
}

impl Downsampler {
    /// Builds a downsampler from `native_rate` to `target_rate`.
    ///
    /// The decimation ratio is `native_rate / target_rate` rounded to the
    /// nearest integer and never below 1, so a device already at (or below)
    /// the target rate passes samples through filtered but not decimated.
    pub fn new(native_rate: u32, target_rate: u32, frame_samples: usize) -> Self {
        let target_rate = target_rate.max(1);
        let native_rate = native_rate.max(1);
        let ratio = ((native_rate as f32 / target_rate as f32).round() as usize).max(1);

        let cutoff = target_rate as f32 / 2.0;
        let rc = 1.0 / (2.0 * PI * cutoff);
        let dt = 1.0 / native_rate as f32;
        let alpha = dt / (rc + dt);

        Self {
            ratio,
            alpha,
            filtered: 0.0,
            phase: 0,
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples.max(1)),
        }
    }

    /// Downsampler for the default recognition format.
    pub fn for_recognition(native_rate: u32) -> Self {
        Self::new(native_rate, TARGET_SAMPLE_RATE, FRAME_SAMPLES)
    }

    pub fn ratio(&self) -> usize {
        self.ratio
    }

    /// Feeds one callback's worth of samples and returns every frame that
    /// filled up. Filter state and decimation phase carry over between calls.
    pub fn push(&mut self, samples: &[f32]) -> Vec<PcmFrame> {
        let mut frames = Vec::new();
        for &sample in samples {
            self.filtered += self.alpha * (sample - self.filtered);
            self.phase += 1;
            if self.phase < self.ratio {
                continue;
            }
            self.phase = 0;
            self.pending.push(to_i16(self.filtered));
            if self.pending.len() == self.frame_samples {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_samples));
                frames.push(PcmFrame(full));
            }
        }
        frames
    }

    /// Returns the partially filled frame, if any.
    pub fn flush(&mut self) -> Option<PcmFrame> {
        if self.pending.is_empty() {
            None
        } else {
            Some(PcmFrame(std::mem::take(&mut self.pending)))
        }
    }
}

fn to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}
