//! Minimal HLS media playlist parser.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaylistError {
    #[error("playlist does not start with #EXTM3U")]
    MissingHeader,
    #[error("master playlists are not supported")]
    MasterPlaylist,
    #[error("invalid playlist line {line}: {reason}")]
    Invalid { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub sequence: u64,
    pub duration: Duration,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub target_duration: Duration,
    pub media_sequence: u64,
    pub segments: Vec<Segment>,
    /// `#EXT-X-ENDLIST` seen: no more segments will be added.
    pub end_list: bool,
}

impl MediaPlaylist {
    pub fn is_live(&self) -> bool {
        !self.end_list
    }

    pub fn total_duration(&self) -> Duration {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Sequence number one past the last segment.
    pub fn end_sequence(&self) -> u64 {
        self.media_sequence
            .saturating_add(self.segments.len() as u64)
    }

    /// Segments with a sequence number of at least `sequence`.
    pub fn segments_from(&self, sequence: u64) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(move |s| s.sequence >= sequence)
    }

    pub fn parse(text: &str) -> Result<Self, PlaylistError> {
        let mut lines = text.lines().map(str::trim).enumerate();
        match lines.next() {
            Some((_, "#EXTM3U")) => {}
            _ => return Err(PlaylistError::MissingHeader),
        }

        let mut target_duration = None;
        let mut media_sequence: u64 = 0;
        let mut segments = Vec::new();
        let mut end_list = false;
        let mut next_duration: Option<Duration> = None;

        for (index, line) in lines {
            let line_no = index + 1;
            let invalid = |reason: &str| PlaylistError::Invalid {
                line: line_no,
                reason: reason.to_string(),
            };

            if line.is_empty() {
                continue;
            }
            if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| invalid("bad target duration"))?;
                target_duration = Some(Duration::from_secs(secs));
            } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
                media_sequence = value.parse().map_err(|_| invalid("bad media sequence"))?;
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let secs = value.split(',').next().unwrap_or_default();
                let secs: f64 = secs.parse().map_err(|_| invalid("bad segment duration"))?;
                let duration = Duration::try_from_secs_f64(secs)
                    .map_err(|_| invalid("bad segment duration"))?;
                next_duration = Some(duration);
            } else if line == "#EXT-X-ENDLIST" {
                end_list = true;
            } else if line.starts_with("#EXT-X-STREAM-INF") {
                return Err(PlaylistError::MasterPlaylist);
            } else if line.starts_with('#') {
                continue;
            } else {
                let duration = next_duration
                    .take()
                    .ok_or_else(|| invalid("segment URI without #EXTINF"))?;
                // The sequence after this segment must be representable too.
                let sequence = media_sequence
                    .checked_add(segments.len() as u64)
                    .filter(|sequence| sequence.checked_add(1).is_some())
                    .ok_or_else(|| invalid("media sequence overflow"))?;
                segments.push(Segment {
                    sequence,
                    duration,
                    uri: line.to_string(),
                });
            }
        }

        let target_duration = target_duration.ok_or(PlaylistError::Invalid {
            line: 0,
            reason: "missing #EXT-X-TARGETDURATION".to_string(),
        })?;

        Ok(Self {
            target_duration,
            media_sequence,
            segments,
            end_list,
        })
    }
}
