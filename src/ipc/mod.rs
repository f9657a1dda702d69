//! Control channel surface
//!
//! Start/stop commands and their acknowledgements for the host UI.

mod commands;

pub use commands::{
    dispatch, get_status, start_recording, stop_recording, teardown, ControlError, MethodResult,
    StatusResponse, ALREADY_RECORDING, RECORDING_ERROR, RECORDING_STARTED, RECORDING_STOPPED,
};
