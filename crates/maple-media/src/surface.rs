use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use maple_common::lock_unpoisoned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{FrameSink, MediaStream, PlaybackSurface};

struct Attached {
    id: String,
    pump: JoinHandle<()>,
}

/// Surface that pumps the attached stream into a [`FrameSink`].
///
/// Each attach bumps an epoch; a pump only renders while its epoch is current,
/// so a replaced stream cannot deliver even one more chunk after `attach`
/// returns. Must be used from within a tokio runtime.
pub struct StreamSurface {
    sink: Arc<Mutex<Box<dyn FrameSink>>>,
    slot: Mutex<Option<Attached>>,
    epoch: Arc<AtomicU64>,
    rendered: Arc<AtomicU64>,
}

impl StreamSurface {
    pub fn new(sink: impl FrameSink + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
            slot: Mutex::new(None),
            epoch: Arc::new(AtomicU64::new(0)),
            rendered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total chunks accepted by the sink across all attached streams.
    pub fn frames_rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }
}

impl PlaybackSurface for StreamSurface {
    fn attach(&self, stream: MediaStream) {
        let mut slot = lock_unpoisoned(&self.slot);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = slot.take() {
            previous.pump.abort();
            info!("surface: replacing stream {} with {}", previous.id, stream.id());
        } else {
            info!("surface: attaching {} stream {}", stream.kind(), stream.id());
        }

        let id = stream.id().to_string();
        let pump = tokio::spawn(pump(
            stream,
            self.sink.clone(),
            self.epoch.clone(),
            epoch,
            self.rendered.clone(),
        ));
        *slot = Some(Attached { id, pump });
    }

    fn detach(&self) {
        let mut slot = lock_unpoisoned(&self.slot);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(previous) = slot.take() {
            previous.pump.abort();
            info!("surface: detached stream {}", previous.id);
        }
    }

    fn attached(&self) -> Option<String> {
        lock_unpoisoned(&self.slot).as_ref().map(|a| a.id.clone())
    }
}

impl Drop for StreamSurface {
    fn drop(&mut self) {
        if let Some(previous) = lock_unpoisoned(&self.slot).take() {
            previous.pump.abort();
        }
    }
}

async fn pump(
    stream: MediaStream,
    sink: Arc<Mutex<Box<dyn FrameSink>>>,
    epoch: Arc<AtomicU64>,
    mine: u64,
    rendered: Arc<AtomicU64>,
) {
    loop {
        match stream.source().next_chunk().await {
            Ok(Some(chunk)) => {
                let result = {
                    let mut sink = lock_unpoisoned(&sink);
                    if epoch.load(Ordering::SeqCst) != mine {
                        return;
                    }
                    sink.render(&chunk.payload, chunk.timestamp_us)
                };
                match result {
                    Ok(()) => {
                        rendered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("surface: sink rejected chunk from {}: {}", stream.id(), e);
                        stream.source().on_rejected(&e);
                    }
                }
            }
            Ok(None) => {
                debug!("surface: stream {} ended", stream.id());
                return;
            }
            Err(e) => {
                warn!("surface: stream {} read failed: {}", stream.id(), e);
                return;
            }
        }
    }
}
