use std::collections::VecDeque;
use std::sync::mpsc::Receiver;

use super::PipelineError;
use crate::event::{EventHasher, EventOrigin, GossipEvent, PlatformEvent};
use crate::orphan::OrphanBuffer;
use crate::pces::{PcesEventIterator, PcesReader};
use crate::window::EventWindow;

/// Events read back from a log directory, hashed and tagged
/// [`EventOrigin::Storage`].
#[derive(Debug)]
pub struct PcesEventSource {
    events: PcesEventIterator,
    hasher: EventHasher,
}

impl PcesEventSource {
    #[must_use]
    pub fn new(reader: &PcesReader) -> Self {
        Self {
            events: reader.events(),
            hasher: EventHasher::new(),
        }
    }
}

impl Iterator for PcesEventSource {
    type Item = Result<PlatformEvent, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.events.next()?;
        Some(
            event
                .map(|event| self.hasher.hash(event, EventOrigin::Storage))
                .map_err(PipelineError::from),
        )
    }
}

/// Wraps a source so only linked events come out, parents first.
///
/// Orphans still missing parents when the inner source ends are never
/// yielded; [`buffer`](Self::buffer) shows what was left behind.
#[derive(Debug)]
pub struct OrphanBufferSource<I> {
    inner: I,
    buffer: OrphanBuffer,
    ready: VecDeque<PlatformEvent>,
}

impl<I> OrphanBufferSource<I>
where
    I: Iterator<Item = Result<PlatformEvent, PipelineError>>,
{
    pub fn new(inner: I) -> Self {
        Self::with_window(inner, EventWindow::genesis())
    }

    /// Start from `window`, so parents older than its ancient threshold
    /// count as present.
    pub fn with_window(inner: I, window: EventWindow) -> Self {
        Self {
            inner,
            buffer: OrphanBuffer::with_window(window),
            ready: VecDeque::new(),
        }
    }

    pub const fn buffer(&self) -> &OrphanBuffer {
        &self.buffer
    }
}

impl<I> Iterator for OrphanBufferSource<I>
where
    I: Iterator<Item = Result<PlatformEvent, PipelineError>>,
{
    type Item = Result<PlatformEvent, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(Ok(event));
            }
            match self.inner.next()? {
                Ok(event) => self.ready.extend(self.buffer.submit(event)),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Raw gossip arriving on a channel, hashed and tagged
/// [`EventOrigin::Gossip`]. Ends when every sender is dropped.
#[derive(Debug)]
pub struct ChannelSource {
    rx: Receiver<GossipEvent>,
    hasher: EventHasher,
}

impl ChannelSource {
    #[must_use]
    pub const fn new(rx: Receiver<GossipEvent>) -> Self {
        Self {
            rx,
            hasher: EventHasher::new(),
        }
    }
}

impl Iterator for ChannelSource {
    type Item = Result<PlatformEvent, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.rx.recv().ok()?;
        Some(Ok(self.hasher.hash(event, EventOrigin::Gossip)))
    }
}

/// In-memory source, mostly for tests and tools that already hold events.
#[derive(Debug)]
pub struct VecSource {
    events: std::vec::IntoIter<PlatformEvent>,
}

impl VecSource {
    #[must_use]
    pub fn new(events: Vec<PlatformEvent>) -> Self {
        Self {
            events: events.into_iter(),
        }
    }
}

impl Iterator for VecSource {
    type Item = Result<PlatformEvent, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.events.next().map(Ok)
    }
}
