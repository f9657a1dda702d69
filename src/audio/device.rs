//! Device seam between the capture engine and a concrete input backend
//!
//! The engine only talks to these traits, so the cpal microphone and the
//! scripted devices used in tests are interchangeable.

use super::microphone::MicrophoneError;
use std::time::Duration;

/// Channel layout of the captured stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    /// Single channel
    Mono,
}

impl ChannelLayout {
    /// Number of interleaved channels
    pub fn channels(&self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
        }
    }
}

/// Sample encoding of the captured stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// 16-bit signed little-endian linear PCM
    Pcm16,
}

impl SampleEncoding {
    /// Size of one sample in bytes
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleEncoding::Pcm16 => 2,
        }
    }
}

/// Format requested from the input device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Sample rate in Hz (16kHz for STT consumers)
    pub sample_rate_hz: u32,
    /// Channel layout
    pub channel_layout: ChannelLayout,
    /// Sample encoding
    pub encoding: SampleEncoding,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_rate_hz: 16000,
            channel_layout: ChannelLayout::Mono,
            encoding: SampleEncoding::Pcm16,
        }
    }
}

impl CaptureFormat {
    /// Bytes for one frame (one sample per channel)
    pub fn bytes_per_frame(&self) -> usize {
        self.channel_layout.channels() as usize * self.encoding.bytes_per_sample()
    }

    /// Bytes needed to hold `duration` of audio
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = self.sample_rate_hz as u128 * duration.as_micros() / 1_000_000;
        frames as usize * self.bytes_per_frame()
    }

    /// Audio duration represented by `bytes`
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let frames = (bytes / self.bytes_per_frame()) as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate_hz as u64)
    }
}

/// An open input device handle
#[cfg_attr(test, mockall::automock)]
pub trait AudioDevice: Send {
    /// Whether construction left the device usable
    fn is_initialized(&self) -> bool;

    /// Begin producing samples
    fn start(&mut self) -> Result<(), MicrophoneError>;

    /// Read up to `buffer.len()` bytes of PCM, returns the number of valid bytes
    ///
    /// May block for up to one buffer's worth of audio. Zero is a legal result.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, MicrophoneError>;

    /// Halt sample production
    fn stop(&mut self) -> Result<(), MicrophoneError>;

    /// Release every resource held by the device. Must be safe to call twice.
    fn release(&mut self);
}

/// Factory for input devices
#[cfg_attr(test, mockall::automock)]
pub trait DeviceProvider: Send {
    /// Minimum buffer size in bytes the device accepts for `format`
    fn min_buffer_size(&self, format: &CaptureFormat) -> Result<usize, MicrophoneError>;

    /// Construct a device for `format` with a buffer of `buffer_bytes`
    fn open(
        &self,
        format: &CaptureFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn AudioDevice>, MicrophoneError>;

    /// Backend name for logging
    fn name(&self) -> String;
}
