//! Audio capture from the default microphone
//!
//! Uses cpal for cross-platform capture. The cpal stream lives on a dedicated
//! thread and pushes 16-bit PCM into a ring buffer that `read` drains.

use super::device::{AudioDevice, CaptureFormat, DeviceProvider};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SupportedBufferSize};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Shortest buffer handed out regardless of what the driver reports.
/// Must exceed one poll interval so each read drains what a tick produced.
const MIN_BUFFER_DURATION: Duration = Duration::from_millis(60);

/// Ring buffer size as a multiple of the read buffer
const RING_BUFFER_FACTOR: usize = 8;

/// Sleep between ring buffer checks while a read waits for data
const READ_POLL_STEP: Duration = Duration::from_millis(2);

/// Microphone capture errors
#[derive(Error, Debug)]
pub enum MicrophoneError {
    #[error("No audio device found")]
    NoDevice,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Audio device not initialized")]
    NotInitialized,
}

/// Commands to control the audio thread
enum AudioCommand {
    Play(mpsc::Sender<Result<(), MicrophoneError>>),
    Pause(mpsc::Sender<Result<(), MicrophoneError>>),
    Release,
}

/// Opens the system default input device through cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalProvider;

impl CpalProvider {
    pub fn new() -> Self {
        Self
    }

    /// List available input devices
    pub fn list_devices() -> Vec<String> {
        let host = cpal::default_host();
        host.input_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default()
    }
}

impl DeviceProvider for CpalProvider {
    fn min_buffer_size(&self, format: &CaptureFormat) -> Result<usize, MicrophoneError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(MicrophoneError::NoDevice)?;
        let supported = device
            .default_input_config()
            .map_err(|e| MicrophoneError::ConfigError(e.to_string()))?;

        let driver_min_frames = match supported.buffer_size() {
            SupportedBufferSize::Range { min, .. } => Some(*min),
            SupportedBufferSize::Unknown => None,
        };

        Ok(read_buffer_bytes(format, driver_min_frames, supported.sample_rate().0))
    }

    fn open(
        &self,
        format: &CaptureFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn AudioDevice>, MicrophoneError> {
        let device = CpalDevice::open(format.clone(), buffer_bytes)?;
        Ok(Box::new(device))
    }

    fn name(&self) -> String {
        format!("cpal/{}", cpal::default_host().id().name())
    }
}

/// Handle to a microphone stream running on its own thread
pub struct CpalDevice {
    format: CaptureFormat,
    consumer: HeapCons<u8>,
    command_tx: mpsc::Sender<AudioCommand>,
    thread_handle: Option<JoinHandle<()>>,
    recording: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    initialized: bool,
}

impl CpalDevice {
    /// Build the input stream on a dedicated thread and wait for it to report back
    pub fn open(format: CaptureFormat, buffer_bytes: usize) -> Result<Self, MicrophoneError> {
        let rb = HeapRb::<u8>::new(buffer_bytes.max(1) * RING_BUFFER_FACTOR);
        let (producer, consumer) = rb.split();

        let recording = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let writer = PcmWriter {
            producer,
            recording: Arc::clone(&recording),
            source_rate: format.sample_rate_hz,
            source_channels: 1,
            target_rate: format.sample_rate_hz,
        };

        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread_failed = Arc::clone(&failed);

        let thread_handle = thread::Builder::new()
            .name("micstream-audio".to_string())
            .spawn(move || run_audio_thread(writer, thread_failed, ready_tx, command_rx))
            .map_err(|e| MicrophoneError::StreamError(e.to_string()))?;

        // The thread either reports the build result or dies without a word
        let initialized = match ready_rx.recv() {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                return Err(e);
            }
            Err(_) => false,
        };

        Ok(Self {
            format,
            consumer,
            command_tx,
            thread_handle: Some(thread_handle),
            recording,
            failed,
            initialized,
        })
    }

    fn request(
        &self,
        command: impl FnOnce(mpsc::Sender<Result<(), MicrophoneError>>) -> AudioCommand,
    ) -> Result<(), MicrophoneError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.command_tx
            .send(command(reply_tx))
            .map_err(|_| MicrophoneError::NotInitialized)?;
        reply_rx.recv().map_err(|_| MicrophoneError::NotInitialized)?
    }
}

impl AudioDevice for CpalDevice {
    fn is_initialized(&self) -> bool {
        self.initialized && self.thread_handle.is_some()
    }

    fn start(&mut self) -> Result<(), MicrophoneError> {
        self.consumer.clear();
        // Flag first so the first callback after play is not lost
        self.recording.store(true, Ordering::Relaxed);
        if let Err(e) = self.request(AudioCommand::Play) {
            self.recording.store(false, Ordering::Relaxed);
            return Err(e);
        }
        tracing::info!("Audio capture started");
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, MicrophoneError> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(MicrophoneError::StreamError(
                "input device is no longer available".to_string(),
            ));
        }

        let deadline = Instant::now() + self.format.duration_of(buffer.len());
        while self.consumer.occupied_len() < buffer.len() && Instant::now() < deadline {
            thread::sleep(READ_POLL_STEP);
        }

        // Whole samples only
        let len = self.consumer.occupied_len().min(buffer.len()) & !1;
        Ok(self.consumer.pop_slice(&mut buffer[..len]))
    }

    fn stop(&mut self) -> Result<(), MicrophoneError> {
        self.recording.store(false, Ordering::Relaxed);
        self.request(AudioCommand::Pause)?;
        tracing::info!("Audio capture stopped");
        Ok(())
    }

    fn release(&mut self) {
        self.recording.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread_handle.take() {
            let _ = self.command_tx.send(AudioCommand::Release);
            let _ = handle.join();
            tracing::debug!("Audio device released");
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.release();
    }
}

/// Converts stream callbacks into 16-bit PCM in the ring buffer
struct PcmWriter {
    producer: HeapProd<u8>,
    recording: Arc<AtomicBool>,
    source_rate: u32,
    source_channels: u16,
    target_rate: u32,
}

impl PcmWriter {
    fn write(&mut self, data: &[f32]) {
        if !self.recording.load(Ordering::Relaxed) {
            return;
        }

        let mono = stereo_to_mono(data, self.source_channels);
        let resampled = resample(&mono, self.source_rate, self.target_rate);
        let bytes = encode_pcm16(&resampled);

        let room = self.producer.vacant_len() & !1;
        let pushed = self.producer.push_slice(&bytes[..bytes.len().min(room)]);
        if pushed < bytes.len() {
            tracing::warn!("ring buffer full, dropped {} bytes", bytes.len() - pushed);
        }
    }
}

/// Run the cpal stream until released (in a dedicated thread)
fn run_audio_thread(
    writer: PcmWriter,
    failed: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<Result<(), MicrophoneError>>,
    command_rx: mpsc::Receiver<AudioCommand>,
) {
    let stream = match build_stream(writer, failed) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            tracing::error!("Audio capture error: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while let Ok(command) = command_rx.recv() {
        match command {
            AudioCommand::Play(reply) => {
                let _ = reply.send(
                    stream
                        .play()
                        .map_err(|e| MicrophoneError::StreamError(e.to_string())),
                );
            }
            AudioCommand::Pause(reply) => {
                let _ = reply.send(
                    stream
                        .pause()
                        .map_err(|e| MicrophoneError::StreamError(e.to_string())),
                );
            }
            AudioCommand::Release => break,
        }
    }

    drop(stream);
}

fn build_stream(
    mut writer: PcmWriter,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, MicrophoneError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MicrophoneError::NoDevice)?;

    tracing::info!("Audio device: {:?}", device.name());

    // Use the device's default configuration, converted in the callback
    let supported_config = device
        .default_input_config()
        .map_err(|e| MicrophoneError::ConfigError(e.to_string()))?;

    writer.source_rate = supported_config.sample_rate().0;
    writer.source_channels = supported_config.channels();

    tracing::info!(
        "Audio config: {}Hz {}ch {:?} -> {}Hz mono pcm16",
        writer.source_rate,
        writer.source_channels,
        supported_config.sample_format(),
        writer.target_rate
    );

    let sample_format = supported_config.sample_format();
    let stream_config: cpal::StreamConfig = supported_config.into();

    let error_callback = move |err: cpal::StreamError| {
        tracing::error!("Audio stream error: {}", err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            failed.store(true, Ordering::Relaxed);
        }
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| writer.write(data),
            error_callback,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                writer.write(&samples);
            },
            error_callback,
            None,
        ),
        other => {
            return Err(MicrophoneError::ConfigError(format!(
                "unsupported sample format: {:?}",
                other
            )))
        }
    }
    .map_err(|e| MicrophoneError::StreamError(e.to_string()))?;

    Ok(stream)
}

/// Read buffer size for `format` given the driver minimum in source frames
fn read_buffer_bytes(
    format: &CaptureFormat,
    driver_min_frames: Option<u32>,
    source_rate: u32,
) -> usize {
    // Driver minimum is in source frames, convert to target-rate bytes
    let driver_min = driver_min_frames.map_or(0, |min| {
        let frames = min as u64 * format.sample_rate_hz as u64 / source_rate.max(1) as u64;
        frames as usize * format.bytes_per_frame()
    });

    driver_min.max(format.bytes_for(MIN_BUFFER_DURATION))
}

/// Simple linear resample from source_rate to target_rate
fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 * ratio;
        let idx_floor = (src_idx.floor() as usize).min(samples.len() - 1);
        let idx_ceil = (idx_floor + 1).min(samples.len() - 1);
        let frac = (src_idx - idx_floor as f64) as f32;

        output.push(samples[idx_floor] * (1.0 - frac) + samples[idx_ceil] * frac);
    }

    output
}

/// Convert interleaved multi-channel audio to mono
fn stereo_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks(channels as usize)
        .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Float samples to 16-bit little-endian PCM bytes
fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| ((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).to_le_bytes())
        .collect()
}
