//! Event-stream subscriber for bitcoind's ZMQ notification interface.
//!
//! bitcoind publishes multipart messages of three frames: a topic string,
//! an opaque payload, and a little-endian `u32` sequence number. The
//! subscriber is best-effort by contract (sockets drop messages under load
//! and across reconnects), so the monitor never depends on it for
//! correctness; the reconciliation sweep re-derives anything missed.
//!
//! Registered topics feed bounded channels. The receive loop never does more
//! per message than an enqueue, and a slow or failed consumer costs messages
//! on its own topic rather than stalling the socket.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use zeromq::{Socket as _, SocketRecv as _, SubSocket, ZmqMessage};

use crate::error::Error;

/// Raw transaction bytes, published on every mempool acceptance.
pub(crate) const TOPIC_RAW_TX: &str = "rawtx";
/// 32-byte block hash, published on every chain-tip update.
pub(crate) const TOPIC_HASH_BLOCK: &str = "hashblock";

/// Per-topic channel capacity. A burst beyond this drops messages for that
/// topic; the reconciliation sweep covers the gap.
const CHANNEL_CAPACITY: usize = 1024;

const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// One notification from the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StreamEvent {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) sequence: u32,
}

/// Subscriber health, observable by the monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamHealth {
    /// Connected, or not yet past the reconnect-attempt budget.
    Healthy,
    /// Reconnection has failed more than the configured number of times in a
    /// row. The stream keeps retrying, but pushes cannot be relied on.
    Degraded,
}

#[derive(Debug)]
pub(crate) enum StreamError {
    Connect(zeromq::ZmqError),
    Subscribe(zeromq::ZmqError),
    Receive(zeromq::ZmqError),
    /// A message that is not topic/payload/sequence.
    MalformedFrame(&'static str),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Connect(e) => write!(f, "connect failed: {e}"),
            StreamError::Subscribe(e) => write!(f, "subscribe failed: {e}"),
            StreamError::Receive(e) => write!(f, "receive failed: {e}"),
            StreamError::MalformedFrame(what) => write!(f, "malformed message: {what}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Splits a node message into its topic, payload, and sequence number.
pub(crate) fn parse_message(message: ZmqMessage) -> Result<StreamEvent, StreamError> {
    let frames: [&[u8]; 3] = message
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<&[u8]>>()
        .try_into()
        .map_err(|_| StreamError::MalformedFrame("expected 3 frames"))?;

    let [topic, payload, sequence_bytes] = frames;

    let topic = std::str::from_utf8(topic)
        .map_err(|_| StreamError::MalformedFrame("topic is not UTF-8"))?
        .to_owned();

    let sequence: [u8; 4] = sequence_bytes
        .try_into()
        .map_err(|_| StreamError::MalformedFrame("sequence is not 4 bytes"))?;

    Ok(StreamEvent {
        topic,
        payload: payload.to_vec(),
        sequence: u32::from_le_bytes(sequence),
    })
}

/// A reconnecting subscriber over a fixed topic set.
pub(crate) struct EventStream {
    endpoint: String,
    max_reconnect_attempts: u32,
    topics: HashMap<String, mpsc::Sender<StreamEvent>>,
    health: watch::Sender<StreamHealth>,
}

impl EventStream {
    pub(crate) fn new(endpoint: &str, max_reconnect_attempts: u32) -> Self {
        let (health, _) = watch::channel(StreamHealth::Healthy);
        Self {
            endpoint: endpoint.into(),
            max_reconnect_attempts,
            topics: HashMap::new(),
            health,
        }
    }

    /// Registers a topic before the stream starts running.
    pub(crate) fn register(&mut self, topic: &str) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.topics.insert(topic.into(), tx);
        rx
    }

    pub(crate) fn health(&self) -> watch::Receiver<StreamHealth> {
        self.health.subscribe()
    }

    /// Runs until shutdown. Transport failures reconnect with exponential
    /// backoff; past the attempt budget the stream reports itself degraded
    /// and keeps trying at the capped interval.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let mut failures: u32 = 0;
        let mut backoff = RECONNECT_INITIAL;
        let mut last_sequence: HashMap<String, u32> = HashMap::new();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connect().await {
                Ok(mut socket) => {
                    info!(endpoint = %self.endpoint, "event stream connected");
                    loop {
                        let message = tokio::select! {
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return Ok(());
                                }
                                continue;
                            }
                            received = socket.recv() => received,
                        };

                        match message {
                            Ok(message) => {
                                failures = 0;
                                backoff = RECONNECT_INITIAL;
                                let _ = self.health.send(StreamHealth::Healthy);
                                self.dispatch(message, &mut last_sequence);
                            }
                            Err(e) => {
                                warn!(error = %StreamError::Receive(e), "event stream dropped");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, endpoint = %self.endpoint, "event stream connect failed");
                }
            }

            failures += 1;
            if failures > self.max_reconnect_attempts
                && *self.health.borrow() != StreamHealth::Degraded
            {
                warn!(
                    failures,
                    "event stream degraded; relying on reconciliation sweeps until it recovers"
                );
                let _ = self.health.send(StreamHealth::Degraded);
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }
    }

    async fn connect(&self) -> Result<SubSocket, StreamError> {
        let mut socket = SubSocket::new();
        socket
            .connect(&self.endpoint)
            .await
            .map_err(StreamError::Connect)?;
        for topic in self.topics.keys() {
            socket
                .subscribe(topic)
                .await
                .map_err(StreamError::Subscribe)?;
        }
        Ok(socket)
    }

    fn dispatch(&self, message: ZmqMessage, last_sequence: &mut HashMap<String, u32>) {
        let event = match parse_message(message) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "ignoring unparseable stream message");
                return;
            }
        };

        if let Some(last) = last_sequence.get(&event.topic) {
            if event.sequence != last.wrapping_add(1) {
                warn!(
                    topic = %event.topic,
                    expected = last.wrapping_add(1),
                    got = event.sequence,
                    "sequence gap on event stream",
                );
            }
        }
        last_sequence.insert(event.topic.clone(), event.sequence);

        let Some(handler) = self.topics.get(&event.topic) else {
            debug!(topic = %event.topic, "message on unregistered topic");
            return;
        };

        match handler.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(topic = %event.topic, "handler backlog full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(topic = %event.topic, "handler gone, dropping notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(frames: Vec<Vec<u8>>) -> ZmqMessage {
        let frames: Vec<bytes::Bytes> = frames.into_iter().map(bytes::Bytes::from).collect();
        ZmqMessage::try_from(frames).expect("at least one frame")
    }

    #[test]
    fn parses_topic_payload_sequence() {
        let event = parse_message(message(vec![
            b"hashblock".to_vec(),
            vec![0xab; 32],
            7u32.to_le_bytes().to_vec(),
        ]))
        .unwrap();

        assert_eq!(event.topic, TOPIC_HASH_BLOCK);
        assert_eq!(event.payload, vec![0xab; 32]);
        assert_eq!(event.sequence, 7);
    }

    #[test]
    fn sequence_is_little_endian() {
        let event = parse_message(message(vec![
            b"rawtx".to_vec(),
            vec![1, 2, 3],
            vec![0x01, 0x00, 0x00, 0x00],
        ]))
        .unwrap();
        assert_eq!(event.sequence, 1);
    }

    #[test]
    fn rejects_wrong_frame_counts() {
        let two = parse_message(message(vec![b"rawtx".to_vec(), vec![1]]));
        assert!(matches!(two, Err(StreamError::MalformedFrame(_))));

        let four = parse_message(message(vec![
            b"rawtx".to_vec(),
            vec![1],
            vec![0; 4],
            vec![9],
        ]));
        assert!(matches!(four, Err(StreamError::MalformedFrame(_))));
    }

    #[test]
    fn rejects_short_sequence() {
        let event = parse_message(message(vec![b"rawtx".to_vec(), vec![1], vec![0; 2]]));
        assert!(matches!(event, Err(StreamError::MalformedFrame(_))));
    }
}
