#![forbid(unsafe_code)]

//! Playback surface and media stream abstractions.
//!
//! A [`PlaybackSurface`] holds at most one [`MediaStream`] at a time. Streams
//! come either from a negotiated peer connection (one remote track) or from the
//! segment engine (one stream of playlist segments); the surface does not care
//! which.

use async_trait::async_trait;
use bytes::Bytes;
use maple_common::Result;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

mod surface;
mod sink;

pub use sink::{FrameSink, NullSink};
pub use surface::StreamSurface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// One unit of media handed to the surface: an RTP payload or a media segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaChunk {
    pub payload: Bytes,
    pub timestamp_us: u64,
}

/// Producer side of a media stream.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Next chunk, or `None` once the stream has ended.
    async fn next_chunk(&self) -> Result<Option<MediaChunk>>;

    /// Called when the surface's sink refused a chunk from this source.
    fn on_rejected(&self, _reason: &maple_common::Error) {}
}

/// A live stream that can be attached to a [`PlaybackSurface`].
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    kind: MediaKind,
    source: Arc<dyn MediaSource>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, kind: MediaKind, source: Arc<dyn MediaSource>) -> Self {
        Self {
            id: id.into(),
            kind,
            source,
        }
    }

    /// Stream fed through a bounded channel.
    ///
    /// The stream ends when every [`mpsc::Sender`] clone has been dropped.
    pub fn channel(
        id: impl Into<String>,
        kind: MediaKind,
        capacity: usize,
    ) -> (mpsc::Sender<MediaChunk>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let source = Arc::new(ChannelSource {
            rx: Mutex::new(rx),
        });
        (tx, Self::new(id, kind, source))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn source(&self) -> &Arc<dyn MediaSource> {
        &self.source
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

struct ChannelSource {
    rx: Mutex<mpsc::Receiver<MediaChunk>>,
}

#[async_trait]
impl MediaSource for ChannelSource {
    async fn next_chunk(&self) -> Result<Option<MediaChunk>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

/// Output target for a live stream.
///
/// Holds either no stream or exactly one. Attaching replaces whatever was
/// attached before; the replaced stream stops delivering immediately.
pub trait PlaybackSurface: Send + Sync {
    fn attach(&self, stream: MediaStream);

    /// Clear the surface. A no-op when nothing is attached.
    fn detach(&self);

    /// Id of the attached stream, if any.
    fn attached(&self) -> Option<String>;
}
