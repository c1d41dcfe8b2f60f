//! Negotiated peer session: signaling channel plus one peer connection, bound
//! to a playback surface.
//!
//! All collaborator callbacks are funnelled into one queue and handled by a
//! single actor task, so no two handlers ever run at the same time.

use std::sync::Arc;

use maple_common::Result;
use maple_media::PlaybackSurface;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::observer::Subscription;
use crate::peer::{NegotiationStep, PeerConnector, PeerController, PeerEvent};
use crate::recovery::{RecoveryPolicy, RetryCounter, RetryTimer};
use crate::signaling::{ChannelEvent, ChannelNotice, SignalingChannel};
use crate::transport::SignalingConnector;
use crate::types::{ConnectionState, SessionStatus};

enum Event {
    Channel(ChannelNotice),
    Peer { generation: u64, event: PeerEvent },
    Negotiation { generation: u64, step: NegotiationStep },
    Retry { ticket: u64 },
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running negotiated session.
///
/// The session starts connecting as soon as it is created and keeps
/// recovering until [`disconnect`](Self::disconnect) is called or the handle
/// is dropped. A signaling URL the connector rejects fails `start` instead.
pub struct NegotiatedSession {
    tx: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<SessionStatus>,
    task: Option<JoinHandle<()>>,
}

impl NegotiatedSession {
    pub fn start(
        config: SessionConfig,
        signaling: Arc<dyn SignalingConnector>,
        peers: Arc<dyn PeerConnector>,
        surface: Arc<dyn PlaybackSurface>,
    ) -> Result<Self> {
        signaling.validate_url(&config.signaling_url)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);

        let channel = SignalingChannel::new(config.signaling_url.clone(), signaling);
        let channel_tx = tx.clone();
        let subscription = channel.subscribe(move |notice| {
            let _ = channel_tx.send(Event::Channel(notice.clone()));
        });

        let actor = Actor {
            tx: tx.clone(),
            channel,
            _subscription: subscription,
            peers: PeerController::new(peers),
            surface,
            policy: config.retry.policy(),
            attempts: RetryCounter::default(),
            retry: RetryTimer::new(tx.clone()),
            status: status_tx,
        };
        let task = tokio::spawn(actor.run(rx));

        Ok(Self {
            tx,
            status: status_rx,
            task: Some(task),
        })
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Tear the session down: cancel retries, close the channel and peer
    /// connection, clear the surface.
    pub async fn disconnect(mut self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Event::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for NegotiatedSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Actor {
    tx: mpsc::UnboundedSender<Event>,
    channel: SignalingChannel,
    _subscription: Subscription,
    peers: PeerController,
    surface: Arc<dyn PlaybackSurface>,
    policy: Arc<dyn RecoveryPolicy>,
    attempts: RetryCounter,
    retry: RetryTimer<Event>,
    status: watch::Sender<SessionStatus>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        self.connect(SessionStatus::Connecting);

        while let Some(event) = rx.recv().await {
            match event {
                Event::Channel(notice) => self.on_channel(notice).await,
                Event::Peer { generation, event } => self.on_peer(generation, event),
                Event::Negotiation { generation, step } => {
                    self.on_negotiation(generation, step).await
                }
                Event::Retry { ticket } => {
                    if self.retry.fire(ticket) {
                        self.connect(SessionStatus::ConnectingRetry);
                    } else {
                        debug!("ignoring superseded retry #{}", ticket);
                    }
                }
                Event::Shutdown(done) => {
                    self.shutdown();
                    let _ = done.send(());
                    return;
                }
            }
        }
    }

    fn connect(&mut self, status: SessionStatus) {
        self.retry.cancel();
        self.set_status(status);
        self.channel.connect();
    }

    async fn on_channel(&mut self, notice: ChannelNotice) {
        if notice.generation != self.channel.generation() {
            debug!(
                "ignoring event from signaling connection #{}",
                notice.generation
            );
            return;
        }

        match notice.event {
            ChannelEvent::Open => {
                self.attempts.reset();
                self.set_status(SessionStatus::Negotiating);
                if self.peers.has_peer() {
                    self.surface.detach();
                }
                let tx = self.tx.clone();
                let emit = Arc::new(move |generation: u64, event: PeerEvent| {
                    let _ = tx.send(Event::Peer { generation, event });
                });
                if let Err(e) = self.peers.open(emit).await {
                    error!("failed to create peer connection: {}", e);
                    self.channel.close();
                    self.schedule_retry();
                }
            }
            ChannelEvent::Error(reason) => {
                warn!("signaling error: {}", reason);
                self.schedule_retry();
            }
            ChannelEvent::Offer(sdp) => {
                let tx = self.tx.clone();
                let started = self.peers.start_negotiation(sdp, move |generation, step| {
                    let _ = tx.send(Event::Negotiation { generation, step });
                });
                match started {
                    Ok(generation) => info!("negotiating offer on peer connection #{}", generation),
                    Err(e) => warn!("dropping offer: {}", e),
                }
            }
            ChannelEvent::Candidate(candidate) => {
                if let Err(e) = self.peers.add_candidate(candidate).await {
                    warn!("failed to add remote ICE candidate: {}", e);
                }
            }
        }
    }

    fn on_peer(&mut self, generation: u64, event: PeerEvent) {
        if !self.peers.is_current(generation) {
            debug!("ignoring event from peer connection #{}", generation);
            return;
        }

        match event {
            PeerEvent::LocalCandidate(Some(candidate)) => {
                if let Err(e) = self.channel.send_candidate(candidate) {
                    warn!("failed to send local ICE candidate: {}", e);
                }
            }
            PeerEvent::LocalCandidate(None) => debug!("ICE gathering complete"),
            PeerEvent::Track(stream) => {
                info!("remote {} track {} attached", stream.kind(), stream.id());
                self.surface.attach(stream);
            }
            PeerEvent::StateChanged(state) => {
                if let Some(previous) = self.peers.set_state(generation, state) {
                    info!("peer connection #{}: {} -> {}", generation, previous, state);
                }
                match state {
                    state if state.triggers_recovery() => {
                        self.surface.detach();
                        self.peers.teardown();
                        self.set_status(SessionStatus::Idle);
                        self.connect(SessionStatus::Connecting);
                    }
                    ConnectionState::Connecting => self.set_status(SessionStatus::Negotiating),
                    ConnectionState::Connected => self.set_status(SessionStatus::Connected),
                    _ => {}
                }
            }
        }
    }

    async fn on_negotiation(&mut self, generation: u64, step: NegotiationStep) {
        if !self.peers.is_current(generation) {
            debug!("ignoring negotiation result for peer connection #{}", generation);
            return;
        }

        match step {
            NegotiationStep::RemoteApplied => self.peers.on_remote_applied(generation).await,
            NegotiationStep::Answer(answer) => {
                if let Err(e) = self.channel.send_answer(answer.sdp) {
                    warn!("failed to send answer: {}", e);
                }
            }
            NegotiationStep::Failed(e) => {
                error!("negotiation on peer connection #{} failed: {}", generation, e);
            }
        }
    }

    fn schedule_retry(&mut self) {
        match self.attempts.next(self.policy.as_ref()) {
            Some((attempt, delay)) => {
                info!("reconnecting in {:?} (attempt {})", delay, attempt);
                self.set_status(SessionStatus::WillRetry);
                self.retry.schedule(delay, |ticket| Event::Retry { ticket });
            }
            None => {
                error!(
                    "giving up on signaling after {} attempt(s)",
                    self.attempts.attempts()
                );
                self.set_status(SessionStatus::Idle);
            }
        }
    }

    fn shutdown(&mut self) {
        info!("disconnecting session");
        self.retry.cancel();
        self.channel.close();
        self.peers.teardown();
        self.surface.detach();
        self.set_status(SessionStatus::Idle);
    }

    fn set_status(&self, status: SessionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!("session status: {}", status);
        } else {
            debug!("session already {}", status);
        }
    }
}
