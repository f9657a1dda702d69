//! Audio capture module
//!
//! Owns the input device, its start/stop state machine and the cpal backend.

mod device;
mod engine;
mod microphone;

pub use device::{AudioDevice, CaptureFormat, ChannelLayout, DeviceProvider, SampleEncoding};
pub use engine::{CaptureEngine, CaptureError, CaptureState, SampleChunk, StartOutcome, StopOutcome};
pub use microphone::{CpalDevice, CpalProvider, MicrophoneError};

#[cfg(test)]
pub(crate) use device::{MockAudioDevice, MockDeviceProvider};
