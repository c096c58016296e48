//! Source, optional filter, optional mapper, sinks.
//!
//! The same composition serves live intake and offline tools over a log
//! directory (slicing, re-signing, replay checks). [`EventGraphPipeline::process`]
//! pulls until the source is exhausted; it never loops on its own.
//!
//! Streaming sinks see each event as it passes, in constant memory. Batch
//! sinks receive every event at the end, which holds the whole stream in
//! memory; use them only when the stream is known to be small.

pub mod source;

pub use source::{ChannelSource, OrphanBufferSource, PcesEventSource, VecSource};

use tracing::debug;

use crate::error::ErrorCode;
use crate::event::PlatformEvent;
use crate::pces::PcesError;

/// Failure of one pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("event source failed: {0}")]
    Source(#[from] PcesError),

    #[error("mapper failed: {0}")]
    Mapper(#[source] anyhow::Error),

    #[error("sink failed: {0}")]
    Sink(#[source] anyhow::Error),
}

impl PipelineError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Source(err) => err.code(),
            Self::Mapper(_) | Self::Sink(_) => ErrorCode::PipelineStageFailed,
        }
    }
}

/// Anything that yields hashed events until exhausted.
pub type EventSource<'a> = Box<dyn Iterator<Item = Result<PlatformEvent, PipelineError>> + 'a>;

/// Keep the event when `true`.
pub type EventFilter<'a> = Box<dyn FnMut(&PlatformEvent) -> bool + 'a>;

/// Transform an event, e.g. rewrite a field and rehash.
pub type EventMapper<'a> = Box<dyn FnMut(PlatformEvent) -> anyhow::Result<PlatformEvent> + 'a>;

/// Where processed events go.
pub enum EventSink<'a> {
    /// Called once per event as it passes.
    Streaming(Box<dyn FnMut(&PlatformEvent) -> anyhow::Result<()> + 'a>),
    /// Called once with every event, after the source is exhausted.
    Batch(Box<dyn FnOnce(Vec<PlatformEvent>) -> anyhow::Result<()> + 'a>),
}

impl<'a> EventSink<'a> {
    pub fn streaming(sink: impl FnMut(&PlatformEvent) -> anyhow::Result<()> + 'a) -> Self {
        Self::Streaming(Box::new(sink))
    }

    pub fn batch(sink: impl FnOnce(Vec<PlatformEvent>) -> anyhow::Result<()> + 'a) -> Self {
        Self::Batch(Box::new(sink))
    }
}

impl std::fmt::Debug for EventSink<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming(_) => f.write_str("EventSink::Streaming"),
            Self::Batch(_) => f.write_str("EventSink::Batch"),
        }
    }
}

/// Stages of one pipeline.
pub struct PipelineConfig<'a> {
    pub source: EventSource<'a>,
    pub filter: Option<EventFilter<'a>>,
    pub mapper: Option<EventMapper<'a>>,
    pub sinks: Vec<EventSink<'a>>,
}

impl<'a> PipelineConfig<'a> {
    /// A pipeline that pulls from `source` and delivers nowhere.
    pub fn new(source: impl Iterator<Item = Result<PlatformEvent, PipelineError>> + 'a) -> Self {
        Self {
            source: Box::new(source),
            filter: None,
            mapper: None,
            sinks: Vec::new(),
        }
    }
}

/// Counts from one [`EventGraphPipeline::process`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub pulled: u64,
    pub filtered_out: u64,
    pub delivered: u64,
}

/// A configured pipeline, run once.
pub struct EventGraphPipeline<'a> {
    config: PipelineConfig<'a>,
}

impl<'a> EventGraphPipeline<'a> {
    #[must_use]
    pub const fn new(config: PipelineConfig<'a>) -> Self {
        Self { config }
    }

    /// Pull every event from the source through filter, mapper and sinks.
    ///
    /// # Errors
    ///
    /// Stops at the first failing stage and returns its error. Streaming
    /// sinks may already have seen earlier events; batch sinks have not.
    pub fn process(self) -> Result<PipelineStats, PipelineError> {
        let PipelineConfig {
            source,
            mut filter,
            mut mapper,
            sinks,
        } = self.config;

        let mut streaming = Vec::new();
        let mut batches = Vec::new();
        for sink in sinks {
            match sink {
                EventSink::Streaming(sink) => streaming.push(sink),
                EventSink::Batch(sink) => batches.push((sink, Vec::new())),
            }
        }

        let mut stats = PipelineStats::default();
        for event in source {
            let event = event?;
            stats.pulled += 1;

            if filter.as_mut().is_some_and(|keep| !keep(&event)) {
                stats.filtered_out += 1;
                continue;
            }

            let event = match mapper.as_mut() {
                Some(map) => map(event).map_err(PipelineError::Mapper)?,
                None => event,
            };

            for sink in &mut streaming {
                sink(&event).map_err(PipelineError::Sink)?;
            }
            if let Some(((_, last), rest)) = batches.split_last_mut() {
                for (_, pending) in rest {
                    pending.push(event.clone());
                }
                last.push(event);
            }
            stats.delivered += 1;
        }

        for (sink, events) in batches {
            sink(events).map_err(PipelineError::Sink)?;
        }
        debug!(
            pulled = stats.pulled,
            filtered_out = stats.filtered_out,
            delivered = stats.delivered,
            "event graph pipeline finished"
        );
        Ok(stats)
    }
}
