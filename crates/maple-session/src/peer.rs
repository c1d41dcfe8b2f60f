//! Peer connection ownership and offer/answer negotiation.
//!
//! Every peer connection gets a generation number. Events and negotiation
//! results carry it, and anything tagged with a generation other than the
//! current one is ignored by the owner.

use std::sync::Arc;

use async_trait::async_trait;
use maple_common::{Error, Result};
use maple_media::MediaStream;
use tracing::{debug, info, warn};

use crate::types::{ConnectionState, IceCandidate, SessionDescription};

/// Something the peer connection reported.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered candidate. `None` marks the end of gathering.
    LocalCandidate(Option<IceCandidate>),
    Track(MediaStream),
    StateChanged(ConnectionState),
}

/// Callback receiving peer events tagged with their connection generation.
pub type PeerEmitFn = dyn Fn(u64, PeerEvent) + Send + Sync;

/// Where a peer connection delivers its events.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    emit: Arc<PeerEmitFn>,
}

impl PeerEventSink {
    pub fn new(generation: u64, emit: Arc<PeerEmitFn>) -> Self {
        Self { generation, emit }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PeerEvent) {
        (self.emit)(self.generation, event);
    }
}

/// One peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Creates peer connections wired to an event sink.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>>;
}

/// Progress of one offer/answer exchange.
#[derive(Debug)]
pub enum NegotiationStep {
    /// The offer is the remote description; queued candidates may be added.
    RemoteApplied,
    /// The answer is the local description and should be sent.
    Answer(SessionDescription),
    Failed(Error),
}

struct PeerSlot {
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    remote_applied: bool,
    pending: Vec<IceCandidate>,
    state: ConnectionState,
}

/// Owns at most one peer connection at a time.
pub struct PeerController {
    connector: Arc<dyn PeerConnector>,
    generation: u64,
    slot: Option<PeerSlot>,
}

impl PeerController {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            generation: 0,
            slot: None,
        }
    }

    /// Replace the current peer connection with a new one.
    pub async fn open(&mut self, emit: Arc<PeerEmitFn>) -> Result<u64> {
        self.teardown();
        self.generation += 1;
        let generation = self.generation;
        let connection = self
            .connector
            .create(PeerEventSink::new(generation, emit))
            .await?;
        info!("peer connection #{} created", generation);
        self.slot = Some(PeerSlot {
            generation,
            connection,
            remote_applied: false,
            pending: Vec::new(),
            state: ConnectionState::New,
        });
        Ok(generation)
    }

    /// Close the current peer connection, if any. Returns whether one existed.
    pub fn teardown(&mut self) -> bool {
        let Some(slot) = self.slot.take() else {
            return false;
        };
        debug!("closing peer connection #{}", slot.generation);
        tokio::spawn(async move {
            if let Err(e) = slot.connection.close().await {
                debug!("peer connection #{} close failed: {}", slot.generation, e);
            }
        });
        true
    }

    pub fn has_peer(&self) -> bool {
        self.slot.is_some()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|slot| slot.generation == generation)
    }

    /// Record the latest state of the current connection and return the
    /// state it replaced. `None` when `generation` is not current.
    pub fn set_state(
        &mut self,
        generation: u64,
        state: ConnectionState,
    ) -> Option<ConnectionState> {
        match self.slot.as_mut() {
            Some(slot) if slot.generation == generation => {
                Some(std::mem::replace(&mut slot.state, state))
            }
            _ => None,
        }
    }

    /// Answer `offer` on the current connection.
    ///
    /// Runs in a spawned task; each step is reported through `report` tagged
    /// with the connection's generation.
    pub fn start_negotiation<R>(&mut self, offer: String, report: R) -> Result<u64>
    where
        R: Fn(u64, NegotiationStep) + Send + Sync + 'static,
    {
        let slot = self.slot.as_ref().ok_or(Error::NotConnected)?;
        let generation = slot.generation;
        let connection = slot.connection.clone();

        tokio::spawn(async move {
            if let Err(e) = connection
                .set_remote_description(SessionDescription::offer(offer))
                .await
            {
                report(generation, NegotiationStep::Failed(e));
                return;
            }
            report(generation, NegotiationStep::RemoteApplied);

            let answer = match connection.create_answer().await {
                Ok(answer) => answer,
                Err(e) => {
                    report(generation, NegotiationStep::Failed(e));
                    return;
                }
            };
            match connection.set_local_description(answer.clone()).await {
                Ok(()) => report(generation, NegotiationStep::Answer(answer)),
                Err(e) => report(generation, NegotiationStep::Failed(e)),
            }
        });
        Ok(generation)
    }

    /// Mark the remote description applied and flush queued candidates.
    pub async fn on_remote_applied(&mut self, generation: u64) {
        let (connection, pending) = match self.slot.as_mut() {
            Some(slot) if slot.generation == generation => {
                slot.remote_applied = true;
                (slot.connection.clone(), std::mem::take(&mut slot.pending))
            }
            _ => return,
        };
        if !pending.is_empty() {
            debug!(
                "adding {} queued candidate(s) to peer connection #{}",
                pending.len(),
                generation
            );
        }
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("failed to add queued ICE candidate: {}", e);
            }
        }
    }

    /// Add a remote candidate, queueing it until the offer has been applied.
    pub async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        let slot = self.slot.as_mut().ok_or(Error::NotConnected)?;
        if !slot.remote_applied {
            slot.pending.push(candidate);
            return Ok(());
        }
        slot.connection.add_ice_candidate(candidate).await
    }

    pub fn pending_candidates(&self) -> usize {
        self.slot.as_ref().map_or(0, |slot| slot.pending.len())
    }
}

impl Drop for PeerController {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = slot.connection.close().await;
                });
            }
        }
    }
}
