use maple_common::Result;

/// Consumer of the payloads delivered by an attached stream.
///
/// Decoding and presentation live behind this trait; the session layer only
/// moves bytes into it.
pub trait FrameSink: Send {
    fn render(&mut self, payload: &[u8], timestamp_us: u64) -> Result<()>;
}

/// Sink that discards payloads and keeps counters.
#[derive(Debug, Default)]
pub struct NullSink {
    frames: u64,
    bytes: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl FrameSink for NullSink {
    fn render(&mut self, payload: &[u8], timestamp_us: u64) -> Result<()> {
        self.frames += 1;
        self.bytes += payload.len() as u64;
        if self.frames % 300 == 1 {
            tracing::debug!(
                "null sink: {} frames, {} bytes (last @ {} us)",
                self.frames,
                self.bytes,
                timestamp_us
            );
        }
        Ok(())
    }
}
