//! Live video session management for Maple.
//!
//! Two delivery strategies share one shape (establish, monitor, recover):
//! [`NegotiatedSession`] negotiates a peer connection over a signaling
//! channel, [`AdaptiveSession`] pulls an HLS playlist through a
//! [`SegmentEngine`].

#![forbid(unsafe_code)]

pub mod adaptive;
pub mod config;
pub mod hls;
pub mod negotiated;
pub mod observer;
pub mod peer;
pub mod playlist;
pub mod protocol;
pub mod recovery;
pub mod rtc;
pub mod signaling;
pub mod transport;
pub mod types;

pub use adaptive::{AdaptiveSession, AdaptiveStatus};
pub use config::{AdaptiveConfig, RetryConfig, RetryMode, SessionConfig};
pub use hls::{EngineEvent, HlsEngine, SegmentEngine, StreamDuration};
pub use negotiated::NegotiatedSession;
pub use observer::{Observers, Subscription};
pub use peer::{NegotiationStep, PeerConnection, PeerConnector, PeerEvent, PeerEventSink};
pub use recovery::{ExponentialBackoff, FixedDelay, RecoveryPolicy, RetryTimer};
pub use signaling::{ChannelEvent, ChannelNotice, SignalingChannel};
pub use transport::{LinkEvent, SignalingConnector, SignalingLink, WsConnector};
pub use types::{
    ChannelState, ConnectionState, IceCandidate, PlaybackError, SdpType, SessionDescription,
    SessionStatus,
};
pub use rtc::WebRtcConnector;
