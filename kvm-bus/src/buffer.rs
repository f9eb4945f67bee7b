use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

pub type BufferSender = tokio::sync::mpsc::Sender<BufferCmd>;
pub type BufferReceiver = tokio::sync::mpsc::Receiver<BufferCmd>;

/// Item of an encoder input queue. `Eos` ends the forwarding loop.
pub enum BufferCmd {
    Data(Buffer),
    Eos,
}

pub fn buffer_channel(capacity: usize) -> (BufferSender, BufferReceiver) {
    tokio::sync::mpsc::channel(capacity.max(1))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    /// Buffer carries stream headers (parameter sets)
    pub const HEADER: BufferFlags = BufferFlags(1 << 0);
    /// Buffer cannot be decoded on its own
    pub const DELTA_UNIT: BufferFlags = BufferFlags(1 << 1);

    pub fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: BufferFlags) {
        self.0 |= rhs.0;
    }
}

struct BufferInner {
    data: Bytes,
    pts: Option<Duration>,
    duration: Option<Duration>,
    flags: BufferFlags,
}

/// Reference-counted handle to one unit of media.
///
/// `clone()` acquires a reference and `drop` releases it; the payload is freed
/// when the last holder lets go. Contents are never mutated after creation.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::builder(data).build()
    }

    pub fn builder(data: impl Into<Bytes>) -> BufferBuilder {
        BufferBuilder {
            data: data.into(),
            pts: None,
            duration: None,
            flags: BufferFlags::NONE,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.inner.data
    }

    pub fn size(&self) -> usize {
        self.inner.data.len()
    }

    pub fn pts(&self) -> Option<Duration> {
        self.inner.pts
    }

    pub fn duration(&self) -> Option<Duration> {
        self.inner.duration
    }

    pub fn flags(&self) -> BufferFlags {
        self.inner.flags
    }

    /// Header buffers and buffers without the delta-unit flag are keyframes.
    pub fn is_key(&self) -> bool {
        let flags = self.inner.flags;
        flags.contains(BufferFlags::HEADER) || !flags.contains(BufferFlags::DELTA_UNIT)
    }

    /// Number of live references, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("pts", &self.inner.pts)
            .field("duration", &self.inner.duration)
            .field("flags", &self.inner.flags)
            .field("refs", &self.ref_count())
            .finish()
    }
}

pub struct BufferBuilder {
    data: Bytes,
    pts: Option<Duration>,
    duration: Option<Duration>,
    flags: BufferFlags,
}

impl BufferBuilder {
    pub fn pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn build(self) -> Buffer {
        Buffer {
            inner: Arc::new(BufferInner {
                data: self.data,
                pts: self.pts,
                duration: self.duration,
                flags: self.flags,
            }),
        }
    }
}
