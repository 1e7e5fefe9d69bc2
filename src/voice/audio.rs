use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::gateway::constants::SILENCE_FRAME;

/// One opaque, already-encoded audio frame (20 ms of opus).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(pub Bytes);

impl AudioFrame {
    pub const SILENCE: AudioFrame = AudioFrame(Bytes::from_static(&SILENCE_FRAME));

    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for AudioFrame {
    fn from(v: Vec<u8>) -> Self {
        Self(v.into())
    }
}

impl From<Bytes> for AudioFrame {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

/// Polled once per frame tick. `None` means there is nothing to play right now.
pub trait AudioProvider: Send + Sync {
    fn provide(&self) -> Option<AudioFrame>;
}

impl<F> AudioProvider for F
where
    F: Fn() -> Option<AudioFrame> + Send + Sync,
{
    fn provide(&self) -> Option<AudioFrame> {
        self()
    }
}

/// Provider that never has audio.
pub fn silence() -> Arc<dyn AudioProvider> {
    Arc::new(|| None)
}

/// Frames pushed from anywhere through a bounded `flume` channel.
///
/// A tick with an empty queue yields `None`; it never waits.
pub struct ChannelAudioProvider {
    rx: flume::Receiver<AudioFrame>,
}

impl ChannelAudioProvider {
    pub fn new(capacity: usize) -> (Self, flume::Sender<AudioFrame>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { rx }, tx)
    }

    pub fn queued(&self) -> usize {
        self.rx.len()
    }
}

impl AudioProvider for ChannelAudioProvider {
    fn provide(&self) -> Option<AudioFrame> {
        self.rx.try_recv().ok()
    }
}

/// Forwards to whichever provider was installed last.
pub struct SwappableAudioProvider {
    inner: RwLock<Arc<dyn AudioProvider>>,
}

impl SwappableAudioProvider {
    pub fn new(provider: Arc<dyn AudioProvider>) -> Self {
        Self {
            inner: RwLock::new(provider),
        }
    }

    pub fn replace(&self, provider: Arc<dyn AudioProvider>) -> Arc<dyn AudioProvider> {
        std::mem::replace(&mut *self.inner.write(), provider)
    }
}

impl AudioProvider for SwappableAudioProvider {
    fn provide(&self) -> Option<AudioFrame> {
        let provider = self.inner.read().clone();
        provider.provide()
    }
}
