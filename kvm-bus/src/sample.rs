use std::fmt::{Display, Formatter};
use std::time::Duration;

use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;

pub type SampleSender = tokio::sync::mpsc::Sender<Sample>;
/// Encoded output as a `Stream`; ends once every encoder holding the sender is gone.
pub type SampleStream = ReceiverStream<Sample>;

/// Bounded encoder output queue. Producers never block on it: a full queue
/// drops the sample.
pub fn sample_channel(capacity: usize) -> (SampleSender, SampleStream) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
    (tx, ReceiverStream::new(rx))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MediaType {
    #[default]
    Unknown,
    Video,
    Audio,
}

impl Display for MediaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let s = match self {
            MediaType::Unknown => "unknown",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleMetadata {
    pub is_key_frame: bool,
    /// Encoder profile name that produced the sample
    pub source: String,
    pub media_type: MediaType,
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub data: Bytes,
    pub timestamp: Duration,
    pub duration: Duration,
    pub metadata: SampleMetadata,
}

impl Sample {
    pub fn is_key_frame(&self) -> bool {
        self.metadata.is_key_frame
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Sample data_len: {}, timestamp: {:?}, duration: {:?}, key: {}, source: {}, media: {}",
            self.data.len(),
            self.timestamp,
            self.duration,
            self.metadata.is_key_frame,
            self.metadata.source,
            self.metadata.media_type
        )
    }
}
