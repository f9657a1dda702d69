//! Data channel: the single subscriber and the payloads it receives

use crate::audio::SampleChunk;
use thiserror::Error;
use tokio::sync::mpsc;

/// How chunk bytes are turned into integer samples for the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
    /// Every byte reinterpreted as a signed 8-bit value in [-128, 127].
    /// This is the wire format existing consumers decode.
    #[default]
    SignedBytes,
    /// Bytes reassembled into little-endian 16-bit samples.
    /// A trailing odd byte is dropped.
    Pcm16,
}

/// One forwarded chunk as seen by the subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    pub sequence_index: u64,
    pub samples: Vec<i16>,
}

impl ChunkPayload {
    pub fn from_chunk(chunk: &SampleChunk, encoding: PayloadEncoding) -> Self {
        let samples = match encoding {
            PayloadEncoding::SignedBytes => {
                chunk.bytes().iter().map(|&b| b as i8 as i16).collect()
            }
            PayloadEncoding::Pcm16 => chunk
                .bytes()
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        };

        Self {
            sequence_index: chunk.sequence_index(),
            samples,
        }
    }
}

/// Errors when handing a payload to the subscriber
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    #[error("No subscriber attached")]
    NoSubscriber,

    #[error("Subscriber is not keeping up")]
    Full,

    #[error("Subscriber went away")]
    Closed,
}

/// Destination for forwarded chunks
pub trait ChunkSink: Send {
    /// Hand over one payload without blocking
    fn send(&mut self, payload: ChunkPayload) -> Result<(), SinkError>;
}

/// Sink backed by a bounded tokio channel
pub struct ChannelSink {
    tx: mpsc::Sender<ChunkPayload>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ChunkPayload>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver the subscriber reads from
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChunkPayload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl ChunkSink for ChannelSink {
    fn send(&mut self, payload: ChunkPayload) -> Result<(), SinkError> {
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// The sole active subscriber, last attach wins
#[derive(Default)]
pub struct Subscription {
    sink: Option<Box<dyn ChunkSink>>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any previous sink
    pub fn attach(&mut self, sink: Box<dyn ChunkSink>) {
        if self.sink.replace(sink).is_some() {
            tracing::debug!("Previous subscriber replaced");
        } else {
            tracing::debug!("Subscriber attached");
        }
    }

    pub fn detach(&mut self) {
        if self.sink.take().is_some() {
            tracing::debug!("Subscriber detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    /// Forward to the sink. A closed sink is detached.
    pub fn forward(&mut self, payload: ChunkPayload) -> Result<(), SinkError> {
        let sink = self.sink.as_mut().ok_or(SinkError::NoSubscriber)?;
        let result = sink.send(payload);
        if result == Err(SinkError::Closed) {
            self.detach();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(index: u64, bytes: Vec<u8>) -> ChunkPayload {
        ChunkPayload::from_chunk(&SampleChunk::new(index, bytes), PayloadEncoding::default())
    }

    #[test]
    fn test_signed_bytes_payload() {
        let chunk = SampleChunk::new(3, vec![0x00, 0x7f, 0x80, 0xff]);
        let payload = ChunkPayload::from_chunk(&chunk, PayloadEncoding::SignedBytes);
        assert_eq!(payload.sequence_index, 3);
        assert_eq!(payload.samples, vec![0, 127, -128, -1]);
    }

    #[test]
    fn test_pcm16_payload_reassembles_little_endian() {
        let chunk = SampleChunk::new(0, vec![0x34, 0x12, 0x00, 0x80, 0x01]);
        let payload = ChunkPayload::from_chunk(&chunk, PayloadEncoding::Pcm16);
        assert_eq!(payload.samples, vec![0x1234, i16::MIN]);
    }

    #[test]
    fn test_forward_without_subscriber() {
        let mut subscription = Subscription::new();
        assert_eq!(
            subscription.forward(payload(0, vec![1])),
            Err(SinkError::NoSubscriber)
        );
    }

    #[test]
    fn test_last_attach_wins() {
        let mut subscription = Subscription::new();
        let (first, mut first_rx) = ChannelSink::channel(4);
        let (second, mut second_rx) = ChannelSink::channel(4);
        subscription.attach(Box::new(first));
        subscription.attach(Box::new(second));

        subscription.forward(payload(0, vec![1, 2])).unwrap();

        assert!(first_rx.try_recv().is_err());
        assert_eq!(second_rx.try_recv().unwrap().samples, vec![1, 2]);
    }

    #[test]
    fn test_full_sink_drops_payload() {
        let mut subscription = Subscription::new();
        let (sink, mut rx) = ChannelSink::channel(1);
        subscription.attach(Box::new(sink));

        subscription.forward(payload(0, vec![0])).unwrap();
        assert_eq!(
            subscription.forward(payload(1, vec![0])),
            Err(SinkError::Full)
        );
        assert!(subscription.is_attached());
        assert_eq!(rx.try_recv().unwrap().sequence_index, 0);
    }

    #[test]
    fn test_closed_sink_is_detached() {
        let mut subscription = Subscription::new();
        let (sink, rx) = ChannelSink::channel(1);
        subscription.attach(Box::new(sink));
        drop(rx);

        assert_eq!(
            subscription.forward(payload(0, vec![0])),
            Err(SinkError::Closed)
        );
        assert!(!subscription.is_attached());
    }
}
