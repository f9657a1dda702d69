//! micstream - live microphone capture service
//!
//! Captures 16kHz mono PCM from one input device and streams it, chunk by
//! chunk, to a single subscriber under explicit start/stop control.

pub mod audio;
pub mod ipc;
pub mod pipeline;
