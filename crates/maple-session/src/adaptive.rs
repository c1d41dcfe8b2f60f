//! Adaptive segment playback session.
//!
//! Drives a [`SegmentEngine`] against a fixed playlist path and recovers from
//! network and media errors after a delay. While one recovery is pending,
//! further recoverable errors are coalesced into it.

use std::fmt;
use std::sync::Arc;

use maple_common::Result;
use maple_media::PlaybackSurface;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AdaptiveConfig;
use crate::hls::{EngineEvent, SegmentEngine};
use crate::recovery::{RecoveryPolicy, RetryCounter, RetryTimer};
use crate::types::PlaybackError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdaptiveStatus {
    /// Playlist requested, not loaded yet.
    #[default]
    Loading,
    Playing,
    /// A recovery is scheduled.
    Recovering,
    /// An unrecoverable error, or the policy gave up.
    Stalled,
}

impl fmt::Display for AdaptiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Loading => "loading",
            Self::Playing => "playing",
            Self::Recovering => "recovering",
            Self::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

enum Command {
    Recover { ticket: u64 },
    Stop(oneshot::Sender<()>),
}

pub struct AdaptiveSession {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<AdaptiveStatus>,
    task: Option<JoinHandle<()>>,
}

impl AdaptiveSession {
    /// Attach `engine` to `surface` and start loading the playlist.
    pub fn start(
        mut engine: Box<dyn SegmentEngine>,
        surface: Arc<dyn PlaybackSurface>,
        config: AdaptiveConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(AdaptiveStatus::Loading);

        engine.set_events(events_tx);
        engine.attach_media(surface);
        info!("adaptive: loading {}", config.playlist_path);
        engine.load_source(&config.playlist_path);

        let actor = Actor {
            engine,
            path: config.playlist_path,
            policy: config.retry.policy(),
            attempts: RetryCounter::default(),
            retry: RetryTimer::new(commands_tx.clone()),
            status: status_tx,
        };
        let task = tokio::spawn(actor.run(events_rx, commands_rx));

        Self {
            commands: commands_tx,
            status: status_rx,
            task: Some(task),
        }
    }

    pub fn status(&self) -> AdaptiveStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AdaptiveStatus> {
        self.status.clone()
    }

    /// Stop the engine, cancel pending recovery and clear the surface.
    pub async fn stop(mut self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Stop(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for AdaptiveSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Actor {
    engine: Box<dyn SegmentEngine>,
    path: String,
    policy: Arc<dyn RecoveryPolicy>,
    attempts: RetryCounter,
    retry: RetryTimer<Command>,
    status: watch::Sender<AdaptiveStatus>,
}

impl Actor {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.on_engine(event),
                Some(command) = commands.recv() => match command {
                    Command::Recover { ticket } => self.recover(ticket),
                    Command::Stop(done) => {
                        self.retry.cancel();
                        self.engine.stop();
                        info!("adaptive: stopped");
                        let _ = done.send(());
                        return;
                    }
                },
                else => return,
            }
        }
    }

    fn on_engine(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ManifestLoaded {
                media_sequence,
                segments,
            } => {
                debug!(
                    "adaptive: manifest with {} segments from #{}",
                    segments, media_sequence
                );
                self.attempts.reset();
                self.set_status(AdaptiveStatus::Playing);
            }
            EngineEvent::Error(e) => self.on_error(e),
        }
    }

    fn on_error(&mut self, e: PlaybackError) {
        if !e.is_recoverable() {
            error!("adaptive: {} (not recoverable)", e);
            self.set_status(AdaptiveStatus::Stalled);
            return;
        }
        if self.retry.is_pending() {
            debug!("adaptive: {} while recovery is pending, coalesced", e);
            return;
        }
        match self.attempts.next(self.policy.as_ref()) {
            Some((attempt, delay)) => {
                warn!("adaptive: {}; recovering in {:?} (attempt {})", e, delay, attempt);
                self.retry.schedule(delay, |ticket| Command::Recover { ticket });
                self.set_status(AdaptiveStatus::Recovering);
            }
            None => {
                error!(
                    "adaptive: {}; giving up after {} attempt(s)",
                    e,
                    self.attempts.attempts()
                );
                self.set_status(AdaptiveStatus::Stalled);
            }
        }
    }

    fn recover(&mut self, ticket: u64) {
        if !self.retry.fire(ticket) {
            debug!("adaptive: ignoring superseded recovery #{}", ticket);
            return;
        }
        info!("adaptive: recovering, reloading {}", self.path);
        self.engine.recover_media_error();
        self.engine.load_source(&self.path);
        self.set_status(AdaptiveStatus::Loading);
    }

    fn set_status(&self, status: AdaptiveStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!("adaptive status: {}", status);
        }
    }
}
