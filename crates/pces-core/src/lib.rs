//! pces-core library.
//!
//! Intake and durability for gossiped events ahead of consensus: events
//! are hashed, checked against the [`EventWindow`], validated, held in the
//! [`OrphanBuffer`] until their parents are known, and appended to a
//! rotating, crash-safe event log before anything downstream sees them.
//! On restart the log is recovered and replayed through the same path.
//!
//! # Conventions
//!
//! - **Errors**: Each module has its own `thiserror` enum exposing
//!   [`ErrorCode`] via `code()`. `anyhow` only appears at tool boundaries.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod config;
pub mod error;
pub mod event;
pub mod intake;
pub mod lock;
pub mod observer;
pub mod orphan;
pub mod pces;
pub mod pipeline;
pub mod replay;
pub mod slicer;
pub mod window;

pub use config::{IntakeConfig, LogConfig, PcesConfig, load_config};
pub use error::ErrorCode;
pub use event::{
    EventCore, EventDescriptor, EventHash, EventHasher, EventOrigin, GossipEvent, NodeId,
    PlatformEvent, Round, Signature,
};
pub use intake::{DurableLog, IntakeError, IntakePipeline};
pub use orphan::OrphanBuffer;
pub use pces::{PcesError, PcesReader, PcesWriter};
pub use replay::{ReplayError, ReplayReport, Replayer};
pub use window::EventWindow;
