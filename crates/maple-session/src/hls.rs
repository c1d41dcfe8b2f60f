//! Segment playback engine: pulls an HLS media playlist and its segments over
//! HTTP and feeds them to the playback surface as one media stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use maple_common::{lock_unpoisoned, Error, Result};
use maple_media::{MediaChunk, MediaKind, MediaSource, MediaStream, PlaybackSurface};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AdaptiveConfig;
use crate::playlist::{MediaPlaylist, PlaylistError};
use crate::types::PlaybackError;

/// Segments a live stream starts behind the live edge.
const LIVE_EDGE_SEGMENTS: usize = 3;
const FEED_CAPACITY: usize = 8;
/// Floor for live playlist reloads, whatever the target duration says.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ManifestLoaded { media_sequence: u64, segments: usize },
    Error(PlaybackError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamDuration {
    #[default]
    Unknown,
    Finite(Duration),
    Unbounded,
}

/// Playback engine driven by an adaptive session.
pub trait SegmentEngine: Send {
    /// Where the engine reports manifest loads and errors.
    fn set_events(&mut self, events: mpsc::UnboundedSender<EngineEvent>);
    fn attach_media(&mut self, surface: Arc<dyn PlaybackSurface>);
    /// Start loading the playlist at `path`, replacing any current load.
    fn load_source(&mut self, path: &str);
    fn recover_media_error(&mut self);
    fn stop(&mut self);
}

type Feed = Arc<Mutex<Option<mpsc::Sender<MediaChunk>>>>;

pub struct HlsEngine {
    client: reqwest::Client,
    base: Url,
    live_duration_infinity: bool,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
    surface: Option<Arc<dyn PlaybackSurface>>,
    feed: Feed,
    streams: u64,
    duration: Arc<Mutex<StreamDuration>>,
    loader: Option<JoinHandle<()>>,
}

impl HlsEngine {
    pub fn new(config: &AdaptiveConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| Error::config(format!("invalid HLS base URL {}: {e}", config.base_url)))?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            live_duration_infinity: config.live_duration_infinity,
            events: None,
            surface: None,
            feed: Arc::new(Mutex::new(None)),
            streams: 0,
            duration: Arc::new(Mutex::new(StreamDuration::Unknown)),
            loader: None,
        })
    }

    pub fn duration(&self) -> StreamDuration {
        *lock_unpoisoned(&self.duration)
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Attach a fresh stream to the surface and point the feed at it.
    fn attach_stream(&mut self) {
        let Some(surface) = self.surface.clone() else {
            return;
        };
        self.streams += 1;
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let source = SegmentSource {
            rx: tokio::sync::Mutex::new(rx),
            events: self.events.clone(),
        };
        let stream = MediaStream::new(
            format!("hls-{}", self.streams),
            MediaKind::Video,
            Arc::new(source),
        );
        *lock_unpoisoned(&self.feed) = Some(tx);
        surface.attach(stream);
    }

    fn stop_loader(&mut self) {
        if let Some(loader) = self.loader.take() {
            loader.abort();
        }
    }
}

impl SegmentEngine for HlsEngine {
    fn set_events(&mut self, events: mpsc::UnboundedSender<EngineEvent>) {
        self.events = Some(events);
    }

    fn attach_media(&mut self, surface: Arc<dyn PlaybackSurface>) {
        self.surface = Some(surface);
        self.attach_stream();
    }

    fn load_source(&mut self, path: &str) {
        self.stop_loader();
        let url = match self.base.join(path) {
            Ok(url) => url,
            Err(e) => {
                self.emit(EngineEvent::Error(PlaybackError::Other(format!(
                    "invalid playlist path {path}: {e}"
                ))));
                return;
            }
        };
        info!("hls: loading {}", url);
        let loader = Loader {
            client: self.client.clone(),
            url,
            feed: self.feed.clone(),
            events: self.events.clone(),
            duration: self.duration.clone(),
            live_duration_infinity: self.live_duration_infinity,
        };
        self.loader = Some(tokio::spawn(loader.run()));
    }

    fn recover_media_error(&mut self) {
        info!("hls: recovering media pipeline");
        self.attach_stream();
    }

    fn stop(&mut self) {
        self.stop_loader();
        *lock_unpoisoned(&self.feed) = None;
        if let Some(surface) = self.surface.take() {
            surface.detach();
        }
    }
}

impl Drop for HlsEngine {
    fn drop(&mut self) {
        self.stop_loader();
    }
}

struct Loader {
    client: reqwest::Client,
    url: Url,
    feed: Feed,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
    duration: Arc<Mutex<StreamDuration>>,
    live_duration_infinity: bool,
}

impl Loader {
    fn emit(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    async fn run(self) {
        if let Err(e) = self.load().await {
            warn!("hls: {}", e);
            self.emit(EngineEvent::Error(e));
        }
    }

    async fn load(&self) -> std::result::Result<(), PlaybackError> {
        let mut next_sequence = None;
        let mut announced = false;
        let mut timestamp_us = 0u64;

        loop {
            let playlist = self.fetch_playlist().await?;
            *lock_unpoisoned(&self.duration) = if playlist.is_live() && self.live_duration_infinity {
                StreamDuration::Unbounded
            } else {
                StreamDuration::Finite(playlist.total_duration())
            };
            if !announced {
                announced = true;
                info!(
                    "hls: manifest loaded ({} segments from #{}, {})",
                    playlist.segments.len(),
                    playlist.media_sequence,
                    if playlist.is_live() { "live" } else { "vod" }
                );
                self.emit(EngineEvent::ManifestLoaded {
                    media_sequence: playlist.media_sequence,
                    segments: playlist.segments.len(),
                });
            }

            let start = resume_sequence(&playlist, next_sequence);
            for segment in playlist.segments_from(start) {
                let url = self.url.join(&segment.uri).map_err(|e| {
                    PlaybackError::Other(format!("invalid segment URI {}: {e}", segment.uri))
                })?;
                let payload = self.fetch(&url).await?.bytes().await.map_err(network)?;
                debug!("hls: segment #{} ({} bytes)", segment.sequence, payload.len());
                self.deliver(MediaChunk {
                    payload,
                    timestamp_us,
                })
                .await;
                let elapsed_us = u64::try_from(segment.duration.as_micros()).unwrap_or(u64::MAX);
                timestamp_us = timestamp_us.saturating_add(elapsed_us);
                next_sequence = Some(segment.sequence.saturating_add(1));
            }

            if !playlist.is_live() {
                info!("hls: reached end of playlist");
                return Ok(());
            }
            tokio::time::sleep(refresh_interval(&playlist)).await;
        }
    }

    async fn fetch_playlist(&self) -> std::result::Result<MediaPlaylist, PlaybackError> {
        let text = self.fetch(&self.url).await?.text().await.map_err(network)?;
        MediaPlaylist::parse(&text).map_err(|e| match e {
            PlaylistError::MasterPlaylist => PlaybackError::Other(e.to_string()),
            e => PlaybackError::Network(format!("unusable playlist: {e}")),
        })
    }

    async fn fetch(&self, url: &Url) -> std::result::Result<reqwest::Response, PlaybackError> {
        self.client
            .get(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(network)
    }

    async fn deliver(&self, chunk: MediaChunk) {
        let feed = lock_unpoisoned(&self.feed).clone();
        match feed {
            Some(feed) => {
                if feed.send(chunk).await.is_err() {
                    debug!("hls: stream detached, dropping segment");
                }
            }
            None => debug!("hls: no media attached, dropping segment"),
        }
    }
}

fn network(e: reqwest::Error) -> PlaybackError {
    PlaybackError::Network(e.to_string())
}

/// First segment to play: the start of a VOD playlist, or a few segments
/// behind the live edge.
fn start_sequence(playlist: &MediaPlaylist) -> u64 {
    if !playlist.is_live() {
        return playlist.media_sequence;
    }
    let skip = playlist.segments.len().saturating_sub(LIVE_EDGE_SEGMENTS);
    playlist
        .segments
        .get(skip)
        .map_or(playlist.media_sequence, |s| s.sequence)
}

/// Where to continue after a reload. A playlist that ends before the last
/// delivered segment was restarted upstream, so playback starts over from it.
fn resume_sequence(playlist: &MediaPlaylist, next: Option<u64>) -> u64 {
    match next {
        Some(next) if next <= playlist.end_sequence() => next,
        Some(next) => {
            info!(
                "hls: media sequence went back from #{} to #{}, restarting",
                next,
                playlist.media_sequence
            );
            start_sequence(playlist)
        }
        None => start_sequence(playlist),
    }
}

fn refresh_interval(playlist: &MediaPlaylist) -> Duration {
    playlist.target_duration.max(MIN_REFRESH_INTERVAL)
}

/// Segments delivered to the surface; sink rejections become media errors.
struct SegmentSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<MediaChunk>>,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
}

#[async_trait]
impl MediaSource for SegmentSource {
    async fn next_chunk(&self) -> Result<Option<MediaChunk>> {
        Ok(self.rx.lock().await.recv().await)
    }

    fn on_rejected(&self, reason: &Error) {
        if let Some(events) = &self.events {
            let _ = events.send(EngineEvent::Error(PlaybackError::Media(reason.to_string())));
        }
    }
}
