//! Capture service: the single control task
//!
//! Owns the engine, the pump and the subscription. Control commands, pump
//! ticks and subscriber changes are all handled serially by `run`, so none of
//! that state needs a lock.

use super::pump::{PumpConfig, PumpStats, StreamPump};
use super::sink::{ChannelSink, ChunkPayload, ChunkSink, Subscription};
use crate::audio::{
    CaptureEngine, CaptureError, CaptureState, DeviceProvider, StartOutcome, StopOutcome,
};
use std::ops::ControlFlow;
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant};

const COMMAND_QUEUE: usize = 32;

/// Errors seen by users of a `ServiceHandle`
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("Capture service is not running")]
    NotRunning,
}

/// Snapshot of the service state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: CaptureState,
    pub subscribed: bool,
    pub buffer_capacity: Option<usize>,
    pub stats: PumpStats,
}

impl ServiceStatus {
    pub fn is_recording(&self) -> bool {
        self.state == CaptureState::Recording
    }
}

/// Messages accepted by the service task
pub enum ControlCommand {
    StartRecording {
        reply: oneshot::Sender<Result<StartOutcome, CaptureError>>,
    },
    StopRecording {
        reply: oneshot::Sender<Result<StopOutcome, CaptureError>>,
    },
    Status {
        reply: oneshot::Sender<ServiceStatus>,
    },
    Subscribe {
        sink: Box<dyn ChunkSink>,
    },
    Unsubscribe,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct CaptureService<P: DeviceProvider> {
    engine: CaptureEngine<P>,
    pump: StreamPump,
    subscription: Subscription,
    commands: mpsc::Receiver<ControlCommand>,
}

impl<P: DeviceProvider + 'static> CaptureService<P> {
    /// Build a service and the handle that talks to it
    pub fn new(provider: P, config: PumpConfig) -> (Self, ServiceHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let handle = ServiceHandle {
            tx,
            sink_capacity: config.sink_capacity,
        };
        let service = Self {
            engine: CaptureEngine::new(provider),
            pump: StreamPump::new(&config),
            subscription: Subscription::new(),
            commands,
        };
        (service, handle)
    }

    /// Build a service and run it on the current tokio runtime
    pub fn spawn(provider: P, config: PumpConfig) -> (ServiceHandle, JoinHandle<()>) {
        let (service, handle) = Self::new(provider, config);
        (handle, tokio::spawn(service.run()))
    }

    /// Serve commands and ticks until shutdown or until every handle is gone
    pub async fn run(mut self) {
        tracing::info!("Capture service started");

        loop {
            let deadline = self.pump.deadline();
            let tick = time::sleep_until(deadline.unwrap_or_else(Instant::now));

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => break,
                },

                _ = tick, if deadline.is_some() => {
                    let started = Instant::now();
                    let pump = &mut self.pump;
                    let engine = &mut self.engine;
                    let subscription = &mut self.subscription;
                    blocking_section(|| pump.tick(engine, subscription, started));
                }
            }
        }

        self.teardown();
        tracing::info!("Capture service stopped");
    }

    fn handle_command(&mut self, command: ControlCommand) -> ControlFlow<()> {
        match command {
            ControlCommand::StartRecording { reply } => {
                let _ = reply.send(self.start_recording());
            }
            ControlCommand::StopRecording { reply } => {
                let _ = reply.send(self.stop_recording());
            }
            ControlCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ControlCommand::Subscribe { sink } => self.subscription.attach(sink),
            ControlCommand::Unsubscribe => self.subscription.detach(),
            ControlCommand::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn start_recording(&mut self) -> Result<StartOutcome, CaptureError> {
        let outcome = self.engine.open_and_start().map_err(|e| {
            tracing::error!("Recording failed to start: {}", e);
            e
        })?;

        match outcome {
            StartOutcome::Started => {
                self.pump.begin(Instant::now());
                tracing::info!("Recording started");
            }
            StartOutcome::AlreadyRecording => tracing::debug!("Already recording"),
        }
        Ok(outcome)
    }

    fn stop_recording(&mut self) -> Result<StopOutcome, CaptureError> {
        let stats = self.pump.cancel();
        let outcome = self.engine.stop()?;
        if outcome == StopOutcome::Stopped {
            tracing::info!(
                forwarded = stats.forwarded,
                dropped = stats.dropped,
                empty_reads = stats.empty_reads,
                read_errors = stats.read_errors,
                "Recording stopped"
            );
        }
        Ok(outcome)
    }

    fn status(&self) -> ServiceStatus {
        ServiceStatus {
            state: self.engine.state(),
            subscribed: self.subscription.is_attached(),
            buffer_capacity: self.engine.buffer_capacity(),
            stats: self.pump.stats(),
        }
    }

    /// Forced stop, errors discarded
    fn teardown(&mut self) {
        self.pump.cancel();
        self.engine.shutdown();
    }
}

/// Run a device read that may block for up to one buffer of audio.
///
/// On a multi-threaded runtime the worker hands its other tasks off first. A
/// current-thread runtime has nowhere to move them, so the call runs inline.
fn blocking_section<R>(f: impl FnOnce() -> R) -> R {
    match Handle::current().runtime_flavor() {
        RuntimeFlavor::MultiThread => task::block_in_place(f),
        _ => f(),
    }
}

/// Cloneable client for a running `CaptureService`
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<ControlCommand>,
    sink_capacity: usize,
}

impl ServiceHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T, PipelineError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| PipelineError::NotRunning)?;
        response.await.map_err(|_| PipelineError::NotRunning)
    }

    async fn notify(&self, command: ControlCommand) -> Result<(), PipelineError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| PipelineError::NotRunning)
    }

    /// Open the device if needed and start capturing
    pub async fn start(&self) -> Result<StartOutcome, PipelineError> {
        Ok(self
            .request(|reply| ControlCommand::StartRecording { reply })
            .await??)
    }

    /// Stop capturing and release the device
    pub async fn stop(&self) -> Result<StopOutcome, PipelineError> {
        Ok(self
            .request(|reply| ControlCommand::StopRecording { reply })
            .await??)
    }

    pub async fn status(&self) -> Result<ServiceStatus, PipelineError> {
        self.request(|reply| ControlCommand::Status { reply }).await
    }

    /// Register `sink` as the sole subscriber, replacing any previous one
    pub async fn subscribe(&self, sink: Box<dyn ChunkSink>) -> Result<(), PipelineError> {
        self.notify(ControlCommand::Subscribe { sink }).await
    }

    /// Subscribe through a bounded channel and return its receiver
    pub async fn listen(&self) -> Result<mpsc::Receiver<ChunkPayload>, PipelineError> {
        let (sink, rx) = ChannelSink::channel(self.sink_capacity);
        self.subscribe(Box::new(sink)).await?;
        Ok(rx)
    }

    pub async fn unsubscribe(&self) -> Result<(), PipelineError> {
        self.notify(ControlCommand::Unsubscribe).await
    }

    /// Stop capture, release the device and end the service task
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        self.request(|reply| ControlCommand::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocking_section_inline_on_current_thread() {
        assert_eq!(blocking_section(|| 7), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_section_on_multi_thread() {
        let other = tokio::spawn(async { 3 });
        let value = blocking_section(|| {
            std::thread::sleep(std::time::Duration::from_millis(20));
            5
        });
        assert_eq!(value, 5);
        assert_eq!(other.await.unwrap(), 3);
    }
}
