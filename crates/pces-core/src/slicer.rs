//! Offline rewriting of an event log into a fresh directory.
//!
//! The slicer reads a log directory, keeps the events a filter selects,
//! lets the caller rewrite each event's core, and writes the survivors to a
//! new directory. Rewritten events get new hashes, so every parent
//! reference is remapped to the migrated descriptor and every event is
//! re-signed by its creator. Parents the filter dropped are removed from
//! their children.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::PathBuf;

use tracing::info;

use crate::config::PcesConfig;
use crate::error::ErrorCode;
use crate::event::{
    EventCore, EventDescriptor, EventHash, EventHasher, EventOrigin, GossipEvent, NodeId,
    PlatformEvent, Round, Signature,
};
use crate::pces::{PcesError, PcesReader, PcesWriter, read_files_from_disk};
use crate::pipeline::{
    EventFilter, EventGraphPipeline, EventSink, OrphanBufferSource, PcesEventSource,
    PipelineConfig, PipelineError,
};
use crate::window::EventWindow;

/// Produces signatures on behalf of event creators.
pub trait EventSigner {
    /// Sign `hash` as `creator`, or `None` if no key is held for it.
    fn sign(&self, creator: NodeId, hash: &EventHash) -> Option<Signature>;
}

impl<F> EventSigner for F
where
    F: Fn(NodeId, &EventHash) -> Option<Signature>,
{
    fn sign(&self, creator: NodeId, hash: &EventHash) -> Option<Signature> {
        self(creator, hash)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SliceError {
    #[error(transparent)]
    Log(#[from] PcesError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("no signing key for creator {creator}")]
    MissingSigner { creator: NodeId },
}

impl SliceError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Log(err) => err.code(),
            Self::Pipeline(err) => err.code(),
            Self::MissingSigner { .. } => ErrorCode::MissingSigner,
        }
    }
}

/// Rewrites applied to each kept event's core before rehashing.
pub type CoreModifier<'a> = Box<dyn FnMut(&mut EventCore) + 'a>;

/// Everything one slicing run needs.
pub struct SliceConfig<'a> {
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    /// Round of the state the source log is read against.
    pub starting_round: Round,
    /// Events below this round are not read.
    pub lower_bound: Round,
    /// Window the orphan buffer and writer start from. Parents at or below
    /// its ancient threshold count as present.
    pub starting_window: Option<EventWindow>,
    pub filter: Option<EventFilter<'a>>,
    pub modifier: Option<CoreModifier<'a>>,
    pub signer: &'a dyn EventSigner,
    pub pces: PcesConfig,
}

impl<'a> SliceConfig<'a> {
    /// Copy everything from `source_dir` to `target_dir`, re-signed.
    pub fn new(
        source_dir: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        signer: &'a dyn EventSigner,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            target_dir: target_dir.into(),
            starting_round: 0,
            lower_bound: 0,
            starting_window: None,
            filter: None,
            modifier: None,
            signer,
            pces: PcesConfig::default(),
        }
    }
}

impl std::fmt::Debug for SliceConfig<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceConfig")
            .field("source_dir", &self.source_dir)
            .field("target_dir", &self.target_dir)
            .field("starting_round", &self.starting_round)
            .field("lower_bound", &self.lower_bound)
            .field("starting_window", &self.starting_window)
            .field("filter", &self.filter.is_some())
            .field("modifier", &self.modifier.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceReport {
    /// Linked events pulled from the source log.
    pub events_read: u64,
    pub filtered_out: u64,
    pub events_written: u64,
    /// Parent references removed because the parent was not migrated.
    pub parents_dropped: u64,
    pub files_written: usize,
}

pub struct PcesGraphSlicer<'a> {
    config: SliceConfig<'a>,
}

impl<'a> PcesGraphSlicer<'a> {
    #[must_use]
    pub const fn new(config: SliceConfig<'a>) -> Self {
        Self { config }
    }

    /// Run the slice to completion.
    ///
    /// # Errors
    ///
    /// Returns [`SliceError::MissingSigner`] when the signer holds no key for
    /// a kept event's creator, or the read or write error that stopped the
    /// run. The target directory may hold a partial log afterwards.
    pub fn slice(self) -> Result<SliceReport, SliceError> {
        let SliceConfig {
            source_dir,
            target_dir,
            starting_round,
            lower_bound,
            starting_window,
            filter,
            modifier,
            signer,
            pces,
        } = self.config;
        let window = starting_window.unwrap_or_else(EventWindow::genesis);

        let reader = PcesReader::open(&pces, &source_dir, starting_round, lower_bound)?;
        let tracker = read_files_from_disk(&pces.log, &target_dir, starting_round)?;
        let mut writer = PcesWriter::open(&pces.log, &target_dir, tracker)?;
        writer.update_event_window(window)?;
        writer.begin_streaming_new_events();

        let parents_dropped = Cell::new(0u64);
        let events_written = Cell::new(0u64);
        let mut migrate = Migrator {
            hasher: EventHasher::new(),
            migrated: HashMap::new(),
            modifier,
            signer,
            parents_dropped: &parents_dropped,
        };

        let source = OrphanBufferSource::with_window(PcesEventSource::new(&reader), window);
        let mut pipeline = PipelineConfig::new(source);
        pipeline.filter = filter;
        pipeline.mapper = Some(Box::new(move |event| migrate.apply(event)));
        pipeline.sinks.push(EventSink::streaming(|event| {
            if writer.write_event(event)? {
                events_written.set(events_written.get() + 1);
            }
            Ok(())
        }));

        let stats = EventGraphPipeline::new(pipeline)
            .process()
            .map_err(unwrap_stage_error)?;
        let tracker = writer.close()?;

        let report = SliceReport {
            events_read: stats.pulled,
            filtered_out: stats.filtered_out,
            events_written: events_written.get(),
            parents_dropped: parents_dropped.get(),
            files_written: tracker.len(),
        };
        info!(
            source = %source_dir.display(),
            target = %target_dir.display(),
            events_read = report.events_read,
            filtered_out = report.filtered_out,
            events_written = report.events_written,
            parents_dropped = report.parents_dropped,
            files = report.files_written,
            "event log sliced"
        );
        Ok(report)
    }
}

struct Migrator<'a, 'c> {
    hasher: EventHasher,
    /// Original hash to the descriptor of its rewritten event.
    migrated: HashMap<EventHash, EventDescriptor>,
    modifier: Option<CoreModifier<'a>>,
    signer: &'a dyn EventSigner,
    parents_dropped: &'c Cell<u64>,
}

impl Migrator<'_, '_> {
    fn apply(&mut self, event: PlatformEvent) -> anyhow::Result<PlatformEvent> {
        let original = event.hash();
        let GossipEvent {
            mut core,
            parents,
            transactions,
            ..
        } = event.into_gossip();

        if let Some(modify) = self.modifier.as_mut() {
            modify(&mut core);
        }
        let mut kept = Vec::with_capacity(parents.len());
        for parent in &parents {
            match self.migrated.get(&parent.hash) {
                Some(descriptor) => kept.push(*descriptor),
                None => self.parents_dropped.set(self.parents_dropped.get() + 1),
            }
        }

        let mut gossip = GossipEvent::new(core, kept, transactions, Signature(Vec::new()));
        let hash = self.hasher.hash_of(&gossip);
        let creator = gossip.creator();
        gossip.signature = self
            .signer
            .sign(creator, &hash)
            .ok_or(SliceError::MissingSigner { creator })?;

        let migrated = PlatformEvent::from_parts(gossip, hash, EventOrigin::Migration);
        self.migrated.insert(original, migrated.descriptor());
        Ok(migrated)
    }
}

/// Recover typed errors that crossed the pipeline's closure boundary.
fn unwrap_stage_error(err: PipelineError) -> SliceError {
    let (inner, rewrap): (anyhow::Error, fn(anyhow::Error) -> PipelineError) = match err {
        PipelineError::Mapper(inner) => (inner, PipelineError::Mapper),
        PipelineError::Sink(inner) => (inner, PipelineError::Sink),
        PipelineError::Source(err) => return SliceError::Log(err),
    };
    match inner.downcast::<SliceError>() {
        Ok(err) => err,
        Err(inner) => match inner.downcast::<PcesError>() {
            Ok(err) => SliceError::Log(err),
            Err(inner) => SliceError::Pipeline(rewrap(inner)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pces::PcesFileTracker;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sign_all(creator: NodeId, hash: &EventHash) -> Option<Signature> {
        let mut bytes = creator.0.to_le_bytes().to_vec();
        bytes.extend_from_slice(&hash.as_bytes()[..4]);
        Some(Signature(bytes))
    }

    /// Two creators alternating, each event pointing at the previous one.
    fn write_chain(dir: &std::path::Path, len: u64) -> Vec<PlatformEvent> {
        let hasher = EventHasher::new();
        let mut writer = PcesWriter::open(&PcesConfig::default().log, dir, PcesFileTracker::new(0))
            .expect("open");
        writer.begin_streaming_new_events();
        let mut out: Vec<PlatformEvent> = Vec::new();
        for round in 1..=len {
            let parents = out.last().map(|prev| vec![prev.descriptor()]).unwrap_or_default();
            let event = hasher.hash(
                GossipEvent::new(
                    EventCore {
                        creator: NodeId(round % 2),
                        birth_round: round,
                        time_created: Utc::now(),
                    },
                    parents,
                    vec![vec![1, 2]],
                    Signature(vec![0]),
                ),
                EventOrigin::Runtime,
            );
            writer.write_event(&event).expect("write");
            out.push(event);
        }
        writer.close().expect("close");
        out
    }

    fn read_all(dir: &std::path::Path) -> Vec<GossipEvent> {
        PcesReader::open(&PcesConfig::default(), dir, 0, 0)
            .expect("reader")
            .events()
            .map(|event| event.expect("event"))
            .collect()
    }

    #[test]
    fn full_copy_resigns_and_relinks() {
        let source = TempDir::new().expect("tempdir");
        let target = TempDir::new().expect("tempdir");
        let original = write_chain(source.path(), 6);

        let signer = sign_all;
        let mut config = SliceConfig::new(source.path(), target.path(), &signer);
        config.modifier = Some(Box::new(|core: &mut EventCore| core.creator = NodeId(core.creator.0 + 10)));
        let report = PcesGraphSlicer::new(config).slice().expect("slice");

        assert_eq!(report.events_read, 6);
        assert_eq!(report.events_written, 6);
        assert_eq!(report.parents_dropped, 0);
        assert_eq!(report.files_written, 1);

        let sliced = read_all(target.path());
        assert_eq!(sliced.len(), 6);
        let hasher = EventHasher::new();
        for pair in sliced.windows(2) {
            let parent_hash = hasher.hash_of(&pair[0]);
            assert_eq!(pair[1].parents.len(), 1);
            assert_eq!(pair[1].parents[0].hash, parent_hash);
            assert_eq!(pair[1].parents[0].creator, pair[0].creator());
        }
        for (new, old) in sliced.iter().zip(&original) {
            assert_eq!(new.creator().0, old.creator().0 + 10);
            let expected = sign_all(new.creator(), &hasher.hash_of(new)).expect("sig");
            assert_eq!(new.signature, expected);
        }
    }

    #[test]
    fn filtered_parents_are_dropped() {
        let source = TempDir::new().expect("tempdir");
        let target = TempDir::new().expect("tempdir");
        write_chain(source.path(), 6);

        let signer = sign_all;
        let mut config = SliceConfig::new(source.path(), target.path(), &signer);
        config.filter = Some(Box::new(|event: &PlatformEvent| event.birth_round() != 3));
        let report = PcesGraphSlicer::new(config).slice().expect("slice");

        assert_eq!(report.filtered_out, 1);
        assert_eq!(report.events_written, 5);
        assert_eq!(report.parents_dropped, 1);

        let sliced = read_all(target.path());
        let round4 = sliced
            .iter()
            .find(|event| event.birth_round() == 4)
            .expect("round 4");
        assert!(round4.parents.is_empty());
    }

    #[test]
    fn missing_key_is_reported() {
        let source = TempDir::new().expect("tempdir");
        let target = TempDir::new().expect("tempdir");
        write_chain(source.path(), 3);

        let signer = |creator: NodeId, hash: &EventHash| {
            (creator == NodeId(1)).then(|| Signature(hash.as_bytes().to_vec()))
        };
        let config = SliceConfig::new(source.path(), target.path(), &signer);
        let err = PcesGraphSlicer::new(config).slice().expect_err("no key");
        assert!(matches!(err, SliceError::MissingSigner { creator: NodeId(0) }));
        assert_eq!(err.code(), ErrorCode::MissingSigner);
    }
}
