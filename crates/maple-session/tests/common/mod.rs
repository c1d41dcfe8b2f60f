#![allow(dead_code)]

//! In-memory doubles for every collaborator a session talks to.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use maple_common::{Error, Result};
use maple_media::{MediaStream, PlaybackSurface};
use maple_session::{
    EngineEvent, IceCandidate, LinkEvent, PeerConnection, PeerConnector, PeerEventSink,
    SegmentEngine, SessionDescription, SignalingConnector, SignalingLink,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Ordered record of side effects shared by all doubles in one test.
pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn position(log: &Log, entry: &str) -> Option<usize> {
    log.lock().unwrap().iter().position(|e| e == entry)
}

pub fn count(log: &Log, entry: &str) -> usize {
    log.lock().unwrap().iter().filter(|e| *e == entry).count()
}

/// Let spawned tasks run without advancing a paused clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Advance a paused clock by `ms` and let everything that woke up run.
pub async fn advance_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}

struct RemoteEnd {
    to_client: mpsc::UnboundedSender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

/// Signaling server double. Every `open` creates a new link.
pub struct MemoryConnector {
    log: Log,
    links: Mutex<Vec<RemoteEnd>>,
    opens: AtomicUsize,
    failures: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(log: Log) -> Arc<Self> {
        Arc::new(Self {
            log,
            links: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        })
    }

    /// Refuse the next `n` opens.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Links whose client side is still alive.
    pub fn live_links(&self) -> usize {
        self.links
            .lock()
            .unwrap()
            .iter()
            .filter(|end| !end.to_client.is_closed())
            .count()
    }

    /// Send a text frame on the most recent link.
    pub fn send(&self, text: &str) {
        let links = self.links.lock().unwrap();
        let end = links.last().expect("no link open");
        let _ = end.to_client.send(LinkEvent::Text(text.to_string()));
    }

    /// Fail the most recent link.
    pub fn break_link(&self) {
        let links = self.links.lock().unwrap();
        let end = links.last().expect("no link open");
        let _ = end.to_client.send(LinkEvent::Error("connection reset".into()));
    }

    /// Everything the client has sent so far, across all links.
    pub fn take_sent(&self) -> Vec<Value> {
        let mut links = self.links.lock().unwrap();
        let mut sent = Vec::new();
        for end in links.iter_mut() {
            while let Ok(text) = end.from_client.try_recv() {
                sent.push(serde_json::from_str(&text).expect("client sent invalid JSON"));
            }
        }
        sent
    }
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn open(&self, _url: &str) -> Result<SignalingLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push("signaling:open".into());
        let refuse = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(Error::transport("connection refused"));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push(RemoteEnd {
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(SignalingLink::new(out_tx, in_rx))
    }
}

pub struct FakePeer {
    pub events: PeerEventSink,
    calls: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct PeerHandle(Arc<FakePeer>);

#[async_trait]
impl PeerConnection for PeerHandle {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if description.sdp.starts_with("bad") {
            return Err(Error::negotiation("unparsable offer"));
        }
        self.0
            .calls
            .lock()
            .unwrap()
            .push(format!("remote:{}", description.sdp));
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer("A1"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.0
            .calls
            .lock()
            .unwrap()
            .push(format!("local:{}", description.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.0
            .calls
            .lock()
            .unwrap()
            .push(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.0.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Peer connection double; keeps every peer it created.
pub struct FakePeerConnector {
    log: Log,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerConnector {
    pub fn new(log: Log) -> Arc<Self> {
        Arc::new(Self {
            log,
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers.lock().unwrap()[index].clone()
    }

    pub fn latest(&self) -> Arc<FakePeer> {
        self.peers.lock().unwrap().last().cloned().expect("no peer created")
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>> {
        self.log.lock().unwrap().push("peer:create".into());
        let peer = Arc::new(FakePeer {
            events,
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(Arc::new(PeerHandle(peer)))
    }
}

/// Surface double recording attach and detach into the shared log.
pub struct RecordingSurface {
    log: Log,
    attached: Mutex<Option<String>>,
}

impl RecordingSurface {
    pub fn new(log: Log) -> Arc<Self> {
        Arc::new(Self {
            log,
            attached: Mutex::new(None),
        })
    }
}

impl PlaybackSurface for RecordingSurface {
    fn attach(&self, stream: MediaStream) {
        self.log
            .lock()
            .unwrap()
            .push(format!("surface:attach:{}", stream.id()));
        *self.attached.lock().unwrap() = Some(stream.id().to_string());
    }

    fn detach(&self) {
        self.log.lock().unwrap().push("surface:detach".into());
        *self.attached.lock().unwrap() = None;
    }

    fn attached(&self) -> Option<String> {
        self.attached.lock().unwrap().clone()
    }
}

/// Segment engine double. Calls are logged with the paused-clock time in ms.
pub struct FakeEngine {
    log: Log,
    started: Instant,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>>,
}

/// Test-side handle for injecting engine events.
#[derive(Clone)]
pub struct EngineHandle {
    events: Arc<Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>>,
}

impl EngineHandle {
    pub fn emit(&self, event: EngineEvent) {
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("engine events not wired")
            .send(event)
            .expect("session gone");
    }
}

impl FakeEngine {
    pub fn new(log: Log) -> (Self, EngineHandle) {
        let events = Arc::new(Mutex::new(None));
        (
            Self {
                log,
                started: Instant::now(),
                events: events.clone(),
            },
            EngineHandle { events },
        )
    }

    fn record(&self, call: &str) {
        let ms = self.started.elapsed().as_millis();
        self.log.lock().unwrap().push(format!("{call}@{ms}"));
    }
}

impl SegmentEngine for FakeEngine {
    fn set_events(&mut self, events: mpsc::UnboundedSender<EngineEvent>) {
        *self.events.lock().unwrap() = Some(events);
    }

    fn attach_media(&mut self, _surface: Arc<dyn PlaybackSurface>) {
        self.record("engine:attach");
    }

    fn load_source(&mut self, path: &str) {
        self.record(&format!("engine:load:{path}"));
    }

    fn recover_media_error(&mut self) {
        self.record("engine:recover");
    }

    fn stop(&mut self) {
        self.record("engine:stop");
    }
}
