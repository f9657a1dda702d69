//! Streaming pipeline
//!
//! Periodic pump from the capture engine to the single subscriber, driven by
//! the capture service task.

mod pump;
mod service;
mod sink;

pub use pump::{DropReason, PumpConfig, PumpStats, StreamPump, TickOutcome};
pub use service::{CaptureService, ControlCommand, PipelineError, ServiceHandle, ServiceStatus};
pub use sink::{ChannelSink, ChunkPayload, ChunkSink, PayloadEncoding, SinkError, Subscription};
