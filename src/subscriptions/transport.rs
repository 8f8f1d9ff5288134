//! Transport contract between the broadcaster and connection handlers.

use super::handle::SubscriptionHandle;
use crate::error::{DbError, Result};
use crossbeam_channel::{bounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of offering a frame to a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Frame taken.
    Accepted,
    /// Frame not taken; the transport will signal drain when it has room.
    Backpressure,
    /// The connection is gone.
    Closed,
}

/// Subscriber connection. `write` must not block.
pub trait Transport: Send + Sync {
    fn write(&self, frame: &[u8]) -> WriteOutcome;
}

/// How frames are encoded on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    /// One JSON object per frame: `{"event": ..., "data": ...}`.
    #[default]
    Json,
    /// Server-sent events: `event: {id}\ndata: {json}\n\n`.
    EventStream,
}

/// A live update for one view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// View id.
    pub event: String,
    /// Full payload, or a serialized [`Delta`](crate::diff::Delta) in delta mode.
    pub data: Value,
}

impl Frame {
    pub fn encode(&self, format: FrameFormat) -> Result<Vec<u8>> {
        match format {
            FrameFormat::Json => Ok(serde_json::to_vec(self)?),
            FrameFormat::EventStream => Ok(format!(
                "event: {}\ndata: {}\n\n",
                self.event,
                serde_json::to_string(&self.data)?
            )
            .into_bytes()),
        }
    }

    pub fn decode(bytes: &[u8], format: FrameFormat) -> Result<Frame> {
        match format {
            FrameFormat::Json => serde_json::from_slice(bytes)
                .map_err(|e| DbError::Deserialization(e.to_string())),
            FrameFormat::EventStream => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| DbError::Deserialization(e.to_string()))?;
                let mut event = None;
                let mut data = None;
                for line in text.lines() {
                    if let Some(rest) = line.strip_prefix("event: ") {
                        event = Some(rest.to_string());
                    } else if let Some(rest) = line.strip_prefix("data: ") {
                        data = Some(
                            serde_json::from_str(rest)
                                .map_err(|e| DbError::Deserialization(e.to_string()))?,
                        );
                    }
                }
                match (event, data) {
                    (Some(event), Some(data)) => Ok(Frame { event, data }),
                    _ => Err(DbError::Deserialization("incomplete event-stream frame".into())),
                }
            }
        }
    }
}

/// In-process transport backed by a bounded channel.
///
/// A full channel reports [`WriteOutcome::Backpressure`]; the paired
/// [`FrameReceiver`] drains the bound subscriptions once it has taken a frame
/// after that.
#[derive(Clone)]
pub struct ChannelTransport {
    sender: Sender<Vec<u8>>,
    blocked: Arc<AtomicBool>,
}

impl ChannelTransport {
    /// Transport holding at most `capacity` undelivered frames.
    pub fn bounded(capacity: usize) -> (Arc<ChannelTransport>, FrameReceiver) {
        let (sender, receiver) = bounded(capacity);
        let blocked = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(ChannelTransport {
            sender,
            blocked: Arc::clone(&blocked),
        });
        let frames = FrameReceiver {
            receiver,
            blocked,
            handles: Mutex::new(Vec::new()),
        };
        (transport, frames)
    }
}

impl Transport for ChannelTransport {
    fn write(&self, frame: &[u8]) -> WriteOutcome {
        match self.sender.try_send(frame.to_vec()) {
            Ok(()) => WriteOutcome::Accepted,
            Err(TrySendError::Full(_)) => {
                self.blocked.store(true, Ordering::SeqCst);
                WriteOutcome::Backpressure
            }
            Err(TrySendError::Disconnected(_)) => WriteOutcome::Closed,
        }
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelTransport(len={})", self.sender.len())
    }
}

/// Receiving end of a [`ChannelTransport`].
///
/// Owns the handles bound to it: dropping the receiver closes the connection
/// and ends those subscriptions.
pub struct FrameReceiver {
    receiver: Receiver<Vec<u8>>,
    blocked: Arc<AtomicBool>,
    handles: Mutex<Vec<SubscriptionHandle>>,
}

impl FrameReceiver {
    /// Tie a subscription's lifetime and drain notifications to this receiver.
    pub fn bind(&self, handle: SubscriptionHandle) {
        self.handles.lock().push(handle);
    }

    pub fn bind_all(&self, handles: impl IntoIterator<Item = SubscriptionHandle>) {
        self.handles.lock().extend(handles);
    }

    /// Receive the next frame (blocking).
    pub fn recv(&self) -> std::result::Result<Vec<u8>, RecvError> {
        let frame = self.receiver.recv()?;
        self.after_receive();
        Ok(frame)
    }

    /// Try to receive a frame (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<Vec<u8>, TryRecvError> {
        let frame = self.receiver.try_recv()?;
        self.after_receive();
        Ok(frame)
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Vec<u8>, RecvTimeoutError> {
        let frame = self.receiver.recv_timeout(timeout)?;
        self.after_receive();
        Ok(frame)
    }

    /// Receive and decode a JSON frame.
    pub fn recv_frame(&self, timeout: Duration) -> Option<Frame> {
        let bytes = self.recv_timeout(timeout).ok()?;
        Frame::decode(&bytes, FrameFormat::Json).ok()
    }

    /// Frames currently buffered.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    fn after_receive(&self) {
        if self.blocked.swap(false, Ordering::SeqCst) {
            for handle in self.handles.lock().iter() {
                handle.drain();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_stream_framing() {
        let frame = Frame {
            event: "v1".into(),
            data: json!({"sum": 6}),
        };
        let bytes = frame.encode(FrameFormat::EventStream).unwrap();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            "event: v1\ndata: {\"sum\":6}\n\n"
        );
        assert_eq!(Frame::decode(&bytes, FrameFormat::EventStream).unwrap(), frame);
    }

    #[test]
    fn test_json_framing() {
        let frame = Frame {
            event: "v1".into(),
            data: json!(6),
        };
        let bytes = frame.encode(FrameFormat::Json).unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&bytes).unwrap(),
            json!({"event": "v1", "data": 6})
        );
    }

    #[test]
    fn test_channel_backpressure_and_close() {
        let (transport, frames) = ChannelTransport::bounded(1);
        assert_eq!(transport.write(b"a"), WriteOutcome::Accepted);
        assert_eq!(transport.write(b"b"), WriteOutcome::Backpressure);

        assert_eq!(frames.try_recv().unwrap(), b"a".to_vec());
        assert_eq!(transport.write(b"c"), WriteOutcome::Accepted);

        drop(frames);
        assert_eq!(transport.write(b"d"), WriteOutcome::Closed);
    }
}
