//! Live delivery of view reductions to subscribers.
//!
//! Each view owns a [`SubscriptionBroadcaster`]. A subscriber attaches with a
//! [`Transport`] and gets back a [`SubscriptionHandle`]:
//! - the first frame is always a full snapshot
//! - later frames are full payloads, or structural deltas in delta mode
//! - a transport reporting backpressure is skipped until it drains, and only
//!   the latest state is sent then
//!
//! # Example
//!
//! ```ignore
//! let (transport, frames) = ChannelTransport::bounded(16);
//! let handle = view.add_subscription(Identity::new(), transport, false)?;
//! frames.bind(handle);
//!
//! while let Some(frame) = frames.recv_frame(Duration::from_secs(30)) {
//!     println!("{}: {}", frame.event, frame.data);
//! }
//! ```

mod broadcaster;
mod handle;
mod transport;

pub use broadcaster::SubscriptionBroadcaster;
pub use handle::{SubscriptionHandle, SubscriptionId};
pub use transport::{ChannelTransport, Frame, FrameFormat, FrameReceiver, Transport, WriteOutcome};
