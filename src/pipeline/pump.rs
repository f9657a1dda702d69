//! Periodic drain of the capture engine into the subscriber
//!
//! The pump never owns a timer itself: it keeps the deadline of its next tick
//! and the owning service sleeps until then. At most one tick is pending, so a
//! slow device makes ticks back up serially instead of overlapping.

use super::sink::{ChunkPayload, PayloadEncoding, SinkError, Subscription};
use crate::audio::{CaptureEngine, DeviceProvider, SampleChunk};
use tokio::time::{Duration, Instant};

/// Pump configuration
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Delay between two ticks, measured from tick start (ms)
    pub poll_interval_ms: u64,
    /// Payload encoding handed to the subscriber
    pub encoding: PayloadEncoding,
    /// Chunks a subscriber may lag behind before new ones are dropped
    pub sink_capacity: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            encoding: PayloadEncoding::SignedBytes,
            sink_capacity: 64,
        }
    }
}

impl PumpConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Per-session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub empty_reads: u64,
    pub read_errors: u64,
}

/// Why a chunk did not reach the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Empty,
    NoSubscriber,
    SinkFull,
    SinkClosed,
}

/// What one tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Capture is no longer active, the pump disarmed itself
    Halted,
    /// Chunk with this sequence index was delivered
    Forwarded(u64),
    Dropped(DropReason),
    ReadFailed,
}

pub struct StreamPump {
    interval: Duration,
    encoding: PayloadEncoding,
    next_tick: Option<Instant>,
    stats: PumpStats,
    consecutive_errors: u64,
}

impl StreamPump {
    pub fn new(config: &PumpConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            encoding: config.encoding,
            next_tick: None,
            stats: PumpStats::default(),
            consecutive_errors: 0,
        }
    }

    /// Arm for a new recording session, first tick at `now`
    pub fn begin(&mut self, now: Instant) {
        self.stats = PumpStats::default();
        self.consecutive_errors = 0;
        self.next_tick = Some(now);
    }

    /// Drop any pending tick and return the session counters
    pub fn cancel(&mut self) -> PumpStats {
        self.next_tick = None;
        self.stats
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn is_armed(&self) -> bool {
        self.next_tick.is_some()
    }

    pub fn stats(&self) -> PumpStats {
        self.stats
    }

    /// Run one tick that started at `started`
    pub fn tick<P: DeviceProvider>(
        &mut self,
        engine: &mut CaptureEngine<P>,
        subscription: &mut Subscription,
        started: Instant,
    ) -> TickOutcome {
        self.next_tick = None;

        if !engine.is_recording() {
            tracing::debug!("Capture inactive, pump halted");
            return TickOutcome::Halted;
        }

        let outcome = match engine.read_chunk() {
            Ok(chunk) => {
                self.consecutive_errors = 0;
                self.forward(chunk, subscription)
            }
            Err(e) => {
                self.stats.read_errors += 1;
                self.consecutive_errors += 1;
                if self.consecutive_errors == 1 {
                    tracing::warn!("Capture read failed: {}", e);
                } else {
                    tracing::trace!(
                        consecutive = self.consecutive_errors,
                        "Capture read failed: {}",
                        e
                    );
                }
                TickOutcome::ReadFailed
            }
        };

        self.next_tick = Some(started + self.interval);
        outcome
    }

    fn forward(&mut self, chunk: SampleChunk, subscription: &mut Subscription) -> TickOutcome {
        if chunk.is_empty() {
            self.stats.empty_reads += 1;
            return TickOutcome::Dropped(DropReason::Empty);
        }
        if !subscription.is_attached() {
            self.stats.dropped += 1;
            return TickOutcome::Dropped(DropReason::NoSubscriber);
        }

        let index = chunk.sequence_index();
        match subscription.forward(ChunkPayload::from_chunk(&chunk, self.encoding)) {
            Ok(()) => {
                self.stats.forwarded += 1;
                TickOutcome::Forwarded(index)
            }
            Err(e) => {
                self.stats.dropped += 1;
                tracing::debug!(sequence = index, "Chunk dropped: {}", e);
                TickOutcome::Dropped(match e {
                    SinkError::NoSubscriber => DropReason::NoSubscriber,
                    SinkError::Full => DropReason::SinkFull,
                    SinkError::Closed => DropReason::SinkClosed,
                })
            }
        }
    }
}
