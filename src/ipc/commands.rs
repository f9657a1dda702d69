//! Control channel commands
//!
//! Every failure is reported as a structured `ControlError` carrying a stable
//! code, never as a panic or an opaque error.

use crate::audio::{CaptureState, StartOutcome};
use crate::pipeline::{PipelineError, PumpStats, ServiceHandle};
use thiserror::Error;

/// Error code for every recording failure
pub const RECORDING_ERROR: &str = "RECORDING_ERROR";

pub const RECORDING_STARTED: &str = "Recording started";
pub const ALREADY_RECORDING: &str = "Already recording";
pub const RECORDING_STOPPED: &str = "Recording stopped";

/// Structured failure returned across the control channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ControlError {
    pub code: &'static str,
    pub message: String,
}

impl ControlError {
    fn recording(error: PipelineError) -> Self {
        Self {
            code: RECORDING_ERROR,
            message: error.to_string(),
        }
    }
}

/// Status answer for the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: String,
    pub is_recording: bool,
    pub has_subscriber: bool,
    pub stats: PumpStats,
}

/// Outcome of a method call by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodResult {
    Success(String),
    Error(ControlError),
    NotImplemented,
}

impl From<Result<String, ControlError>> for MethodResult {
    fn from(result: Result<String, ControlError>) -> Self {
        match result {
            Ok(message) => MethodResult::Success(message),
            Err(e) => MethodResult::Error(e),
        }
    }
}

/// Start capturing and streaming
pub async fn start_recording(handle: &ServiceHandle) -> Result<String, ControlError> {
    match handle.start().await.map_err(ControlError::recording)? {
        StartOutcome::Started => Ok(RECORDING_STARTED.to_string()),
        StartOutcome::AlreadyRecording => Ok(ALREADY_RECORDING.to_string()),
    }
}

/// Stop capturing. Stopping while idle succeeds.
pub async fn stop_recording(handle: &ServiceHandle) -> Result<String, ControlError> {
    handle.stop().await.map_err(ControlError::recording)?;
    Ok(RECORDING_STOPPED.to_string())
}

/// Current service status
pub async fn get_status(handle: &ServiceHandle) -> Result<StatusResponse, ControlError> {
    let status = handle.status().await.map_err(ControlError::recording)?;

    Ok(StatusResponse {
        status: status.state.as_str().to_string(),
        is_recording: status.state == CaptureState::Recording,
        has_subscriber: status.subscribed,
        stats: status.stats,
    })
}

/// Route a method call by name
pub async fn dispatch(handle: &ServiceHandle, method: &str) -> MethodResult {
    match method {
        "startRecording" => start_recording(handle).await.into(),
        "stopRecording" => stop_recording(handle).await.into(),
        other => {
            tracing::debug!("Unknown method: {}", other);
            MethodResult::NotImplemented
        }
    }
}

/// Teardown hook: force a stop and end the service, ignoring every error
pub async fn teardown(handle: &ServiceHandle) {
    if let Err(e) = handle.shutdown().await {
        tracing::debug!("Ignoring error during teardown: {}", e);
    }
}
