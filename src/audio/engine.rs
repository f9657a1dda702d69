//! Capture engine: one device session and its start/stop state machine
//!
//! `Uninitialized → Ready → Recording → Stopped → Ready|Uninitialized`.
//! Every transition happens on the owning control task, so the engine is a
//! plain owned value with no interior locking.

use super::device::{AudioDevice, CaptureFormat, DeviceProvider};
use super::microphone::MicrophoneError;
use thiserror::Error;

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No device held
    Uninitialized,
    /// Device open, not producing samples
    Ready,
    /// Device producing samples
    Recording,
    /// Device released after a stop
    Stopped,
}

impl CaptureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::Uninitialized => "uninitialized",
            CaptureState::Ready => "ready",
            CaptureState::Recording => "recording",
            CaptureState::Stopped => "stopped",
        }
    }
}

/// Capture engine errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to initialize capture device: {0}")]
    DeviceInit(MicrophoneError),

    #[error("Failed to read from capture device: {0}")]
    Read(MicrophoneError),

    #[error("Failed to stop capture device: {0}")]
    Stop(MicrophoneError),

    #[error("No capture session is open")]
    NotOpen,

    #[error("Capture device is not recording")]
    NotRecording,
}

/// Result of a successful `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRecording,
}

/// Result of a successful `stop`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRecording,
}

/// PCM bytes captured by one read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleChunk {
    sequence_index: u64,
    bytes: Vec<u8>,
}

impl SampleChunk {
    pub fn new(sequence_index: u64, bytes: Vec<u8>) -> Self {
        Self {
            sequence_index,
            bytes,
        }
    }

    pub fn sequence_index(&self) -> u64 {
        self.sequence_index
    }

    pub fn byte_length(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// One open device handle
struct CaptureSession {
    device: Box<dyn AudioDevice>,
    buffer: Vec<u8>,
    next_sequence: u64,
}

impl CaptureSession {
    fn release(mut self) {
        self.device.release();
    }
}

/// Owns the capture device and its lifecycle
pub struct CaptureEngine<P: DeviceProvider> {
    provider: P,
    format: CaptureFormat,
    session: Option<CaptureSession>,
    state: CaptureState,
}

impl<P: DeviceProvider> CaptureEngine<P> {
    /// Create an engine using the fixed 16kHz mono PCM16 format
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            format: CaptureFormat::default(),
            session: None,
            state: CaptureState::Uninitialized,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == CaptureState::Recording
    }

    /// Capacity of the session read buffer, if a session is open
    pub fn buffer_capacity(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.buffer.len())
    }

    /// Open a device session. No-op if one is already open.
    pub fn open(&mut self) -> Result<(), CaptureError> {
        if self.session.is_some() {
            return Ok(());
        }

        let buffer_bytes = self
            .provider
            .min_buffer_size(&self.format)
            .map_err(CaptureError::DeviceInit)?;
        if buffer_bytes == 0 {
            return Err(CaptureError::DeviceInit(MicrophoneError::ConfigError(
                "device reported a zero minimum buffer size".to_string(),
            )));
        }

        let mut device = self
            .provider
            .open(&self.format, buffer_bytes)
            .map_err(CaptureError::DeviceInit)?;

        if !device.is_initialized() {
            device.release();
            return Err(CaptureError::DeviceInit(MicrophoneError::NotInitialized));
        }

        tracing::debug!(
            backend = %self.provider.name(),
            buffer_bytes,
            "capture session opened"
        );

        self.session = Some(CaptureSession {
            device,
            buffer: vec![0; buffer_bytes],
            next_sequence: 0,
        });
        self.state = CaptureState::Ready;
        Ok(())
    }

    /// Begin capture on the open session
    pub fn start(&mut self) -> Result<StartOutcome, CaptureError> {
        match self.state {
            CaptureState::Recording => return Ok(StartOutcome::AlreadyRecording),
            CaptureState::Ready => {}
            CaptureState::Uninitialized | CaptureState::Stopped => {
                return Err(CaptureError::NotOpen)
            }
        }

        let session = self.session.as_mut().ok_or(CaptureError::NotOpen)?;
        if let Err(e) = session.device.start() {
            self.release_session();
            self.state = CaptureState::Uninitialized;
            return Err(CaptureError::DeviceInit(e));
        }

        self.state = CaptureState::Recording;
        Ok(StartOutcome::Started)
    }

    /// Open if needed, then start
    pub fn open_and_start(&mut self) -> Result<StartOutcome, CaptureError> {
        if self.is_recording() {
            return Ok(StartOutcome::AlreadyRecording);
        }
        self.open()?;
        self.start()
    }

    /// Read one chunk from the device. Zero-length chunks are legal.
    pub fn read_chunk(&mut self) -> Result<SampleChunk, CaptureError> {
        if self.state != CaptureState::Recording {
            return Err(CaptureError::NotRecording);
        }
        let session = self.session.as_mut().ok_or(CaptureError::NotRecording)?;

        let read = session
            .device
            .read(&mut session.buffer)
            .map_err(CaptureError::Read)?;
        let len = read.min(session.buffer.len());

        let chunk = SampleChunk::new(session.next_sequence, session.buffer[..len].to_vec());
        session.next_sequence += 1;
        Ok(chunk)
    }

    /// Halt and release the device. Succeeds without side effects when idle.
    pub fn stop(&mut self) -> Result<StopOutcome, CaptureError> {
        let Some(mut session) = self.session.take() else {
            return Ok(StopOutcome::NotRecording);
        };

        let was_recording = self.state == CaptureState::Recording;
        let halted = if was_recording {
            session.device.stop()
        } else {
            Ok(())
        };
        session.release();
        self.state = CaptureState::Stopped;

        halted.map_err(CaptureError::Stop)?;
        Ok(if was_recording {
            StopOutcome::Stopped
        } else {
            StopOutcome::NotRecording
        })
    }

    /// Teardown path: stop unconditionally and discard errors
    pub fn shutdown(&mut self) {
        if let Err(e) = self.stop() {
            tracing::debug!("ignoring error during capture shutdown: {}", e);
        }
    }

    fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.release();
        }
    }
}

impl<P: DeviceProvider> Drop for CaptureEngine<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{MockAudioDevice, MockDeviceProvider};

    fn recording_device(fill: u8) -> MockAudioDevice {
        let mut device = MockAudioDevice::new();
        device.expect_is_initialized().return_const(true);
        device.expect_start().returning(|| Ok(()));
        device.expect_read().returning(move |buf: &mut [u8]| {
            buf.fill(fill);
            Ok(buf.len())
        });
        device.expect_stop().returning(|| Ok(()));
        device.expect_release().return_const(());
        device
    }

    fn provider_with(opens: usize) -> MockDeviceProvider {
        let mut provider = MockDeviceProvider::new();
        provider.expect_min_buffer_size().returning(|_| Ok(1280));
        provider
            .expect_open()
            .times(opens)
            .returning(|_, _| Ok(Box::new(recording_device(7))));
        provider.expect_name().returning(|| "mock".to_string());
        provider
    }

    #[test]
    fn test_new_engine_is_uninitialized() {
        let engine = CaptureEngine::new(MockDeviceProvider::new());
        assert_eq!(engine.state(), CaptureState::Uninitialized);
        assert_eq!(engine.buffer_capacity(), None);
    }

    #[test]
    fn test_open_allocates_min_buffer() {
        let mut engine = CaptureEngine::new(provider_with(1));
        engine.open().unwrap();
        assert_eq!(engine.state(), CaptureState::Ready);
        assert_eq!(engine.buffer_capacity(), Some(1280));
    }

    #[test]
    fn test_double_start_opens_device_once() {
        let mut engine = CaptureEngine::new(provider_with(1));
        assert_eq!(engine.open_and_start().unwrap(), StartOutcome::Started);
        assert_eq!(
            engine.open_and_start().unwrap(),
            StartOutcome::AlreadyRecording
        );
        assert_eq!(engine.state(), CaptureState::Recording);
    }

    #[test]
    fn test_start_without_session_fails() {
        let mut engine = CaptureEngine::new(MockDeviceProvider::new());
        assert!(matches!(engine.start(), Err(CaptureError::NotOpen)));
    }

    #[test]
    fn test_open_fails_on_zero_min_buffer() {
        let mut provider = MockDeviceProvider::new();
        provider.expect_min_buffer_size().returning(|_| Ok(0));
        provider.expect_open().never();
        let mut engine = CaptureEngine::new(provider);

        assert!(matches!(engine.open(), Err(CaptureError::DeviceInit(_))));
        assert_eq!(engine.state(), CaptureState::Uninitialized);
    }

    #[test]
    fn test_open_releases_uninitialized_device() {
        let mut provider = MockDeviceProvider::new();
        provider.expect_min_buffer_size().returning(|_| Ok(1280));
        provider.expect_open().returning(|_, _| {
            let mut device = MockAudioDevice::new();
            device.expect_is_initialized().return_const(false);
            device.expect_release().times(1).return_const(());
            Ok(Box::new(device))
        });
        let mut engine = CaptureEngine::new(provider);

        let err = engine.open().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::DeviceInit(MicrophoneError::NotInitialized)
        ));
        assert_eq!(engine.buffer_capacity(), None);
    }

    #[test]
    fn test_device_start_failure_releases_session() {
        let mut provider = MockDeviceProvider::new();
        provider.expect_min_buffer_size().returning(|_| Ok(1280));
        provider.expect_name().returning(|| "mock".to_string());
        provider.expect_open().returning(|_, _| {
            let mut device = MockAudioDevice::new();
            device.expect_is_initialized().return_const(true);
            device
                .expect_start()
                .returning(|| Err(MicrophoneError::StreamError("busy".to_string())));
            device.expect_release().times(1).return_const(());
            Ok(Box::new(device))
        });
        let mut engine = CaptureEngine::new(provider);

        assert!(matches!(
            engine.open_and_start(),
            Err(CaptureError::DeviceInit(_))
        ));
        assert_eq!(engine.state(), CaptureState::Uninitialized);
        assert_eq!(engine.buffer_capacity(), None);
    }

    #[test]
    fn test_read_chunk_requires_recording() {
        let mut engine = CaptureEngine::new(provider_with(1));
        assert!(matches!(engine.read_chunk(), Err(CaptureError::NotRecording)));
        engine.open().unwrap();
        assert!(matches!(engine.read_chunk(), Err(CaptureError::NotRecording)));
    }

    #[test]
    fn test_read_chunk_sequence_increments() {
        let mut engine = CaptureEngine::new(provider_with(1));
        engine.open_and_start().unwrap();

        for expected in 0..4 {
            let chunk = engine.read_chunk().unwrap();
            assert_eq!(chunk.sequence_index(), expected);
            assert_eq!(chunk.byte_length(), 1280);
            assert!(chunk.bytes().iter().all(|&b| b == 7));
        }
    }

    #[test]
    fn test_short_and_empty_reads() {
        let mut provider = MockDeviceProvider::new();
        provider.expect_min_buffer_size().returning(|_| Ok(64));
        provider.expect_name().returning(|| "mock".to_string());
        provider.expect_open().returning(|_, _| {
            let mut device = MockAudioDevice::new();
            let mut reads = vec![0usize, 10].into_iter();
            device.expect_is_initialized().return_const(true);
            device.expect_start().returning(|| Ok(()));
            device
                .expect_read()
                .returning(move |_| Ok(reads.next().unwrap_or(0)));
            device.expect_stop().returning(|| Ok(()));
            device.expect_release().return_const(());
            Ok(Box::new(device))
        });
        let mut engine = CaptureEngine::new(provider);
        engine.open_and_start().unwrap();

        let empty = engine.read_chunk().unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.sequence_index(), 0);

        let short = engine.read_chunk().unwrap();
        assert_eq!(short.byte_length(), 10);
        assert_eq!(short.sequence_index(), 1);
    }

    #[test]
    fn test_read_error_does_not_change_state() {
        let mut provider = MockDeviceProvider::new();
        provider.expect_min_buffer_size().returning(|_| Ok(64));
        provider.expect_name().returning(|| "mock".to_string());
        provider.expect_open().returning(|_, _| {
            let mut device = MockAudioDevice::new();
            device.expect_is_initialized().return_const(true);
            device.expect_start().returning(|| Ok(()));
            device
                .expect_read()
                .returning(|_| Err(MicrophoneError::StreamError("overrun".to_string())));
            device.expect_stop().returning(|| Ok(()));
            device.expect_release().return_const(());
            Ok(Box::new(device))
        });
        let mut engine = CaptureEngine::new(provider);
        engine.open_and_start().unwrap();

        assert!(matches!(engine.read_chunk(), Err(CaptureError::Read(_))));
        assert_eq!(engine.state(), CaptureState::Recording);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut engine = CaptureEngine::new(MockDeviceProvider::new());
        assert_eq!(engine.stop().unwrap(), StopOutcome::NotRecording);
        assert_eq!(engine.state(), CaptureState::Uninitialized);
        assert_eq!(engine.buffer_capacity(), None);
    }

    #[test]
    fn test_stop_releases_device() {
        let mut engine = CaptureEngine::new(provider_with(1));
        engine.open_and_start().unwrap();

        assert_eq!(engine.stop().unwrap(), StopOutcome::Stopped);
        assert_eq!(engine.state(), CaptureState::Stopped);
        assert_eq!(engine.buffer_capacity(), None);
        assert_eq!(engine.stop().unwrap(), StopOutcome::NotRecording);
    }

    #[test]
    fn test_stop_failure_still_releases() {
        let mut provider = MockDeviceProvider::new();
        provider.expect_min_buffer_size().returning(|_| Ok(64));
        provider.expect_name().returning(|| "mock".to_string());
        provider.expect_open().returning(|_, _| {
            let mut device = MockAudioDevice::new();
            device.expect_is_initialized().return_const(true);
            device.expect_start().returning(|| Ok(()));
            device
                .expect_stop()
                .returning(|| Err(MicrophoneError::StreamError("gone".to_string())));
            device.expect_release().times(1).return_const(());
            Ok(Box::new(device))
        });
        let mut engine = CaptureEngine::new(provider);
        engine.open_and_start().unwrap();

        assert!(matches!(engine.stop(), Err(CaptureError::Stop(_))));
        assert_eq!(engine.state(), CaptureState::Stopped);
        assert_eq!(engine.buffer_capacity(), None);
    }

    #[test]
    fn test_restart_opens_fresh_session() {
        let mut engine = CaptureEngine::new(provider_with(2));
        engine.open_and_start().unwrap();
        engine.read_chunk().unwrap();
        engine.read_chunk().unwrap();
        engine.stop().unwrap();

        assert!(matches!(engine.start(), Err(CaptureError::NotOpen)));
        engine.open_and_start().unwrap();
        assert_eq!(engine.read_chunk().unwrap().sequence_index(), 0);
    }

    #[test]
    fn test_shutdown_swallows_errors() {
        let mut provider = MockDeviceProvider::new();
        provider.expect_min_buffer_size().returning(|_| Ok(64));
        provider.expect_name().returning(|| "mock".to_string());
        provider.expect_open().returning(|_, _| {
            let mut device = MockAudioDevice::new();
            device.expect_is_initialized().return_const(true);
            device.expect_start().returning(|| Ok(()));
            device
                .expect_stop()
                .returning(|| Err(MicrophoneError::StreamError("gone".to_string())));
            device.expect_release().return_const(());
            Ok(Box::new(device))
        });
        let mut engine = CaptureEngine::new(provider);
        engine.open_and_start().unwrap();

        engine.shutdown();
        assert_eq!(engine.state(), CaptureState::Stopped);
    }
}
