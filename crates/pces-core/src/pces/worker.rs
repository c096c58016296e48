//! Dedicated append thread.
//!
//! Intake sends released events over a bounded channel; the worker is the
//! only mutator of on-disk state. Each wakeup drains everything queued,
//! writes it, syncs once, and only then forwards the events to consensus.
//! A full queue blocks the sender, which is the backpressure point of the
//! pipeline.

use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use super::PcesError;
use super::tracker::PcesFileTracker;
use super::writer::PcesWriter;
use crate::event::{PlatformEvent, Round};
use crate::intake::DurableLog;
use crate::window::EventWindow;

/// Messages accepted by the worker, applied in order.
#[derive(Debug)]
pub enum LogCommand {
    Events(Vec<PlatformEvent>),
    Window(EventWindow),
    Discontinuity(Round),
    BeginStreaming,
    Shutdown,
}

/// Totals reported when the worker stops.
#[derive(Debug, Default)]
pub struct WorkerReport {
    /// Group commits performed.
    pub batches: u64,
    /// Events made durable and forwarded.
    pub events: u64,
    /// Files left after the final close.
    pub tracker: PcesFileTracker,
}

/// Handle to the append thread.
#[derive(Debug)]
pub struct DurableLogWorker {
    tx: SyncSender<LogCommand>,
    handle: Option<JoinHandle<Result<WorkerReport, PcesError>>>,
    streaming: bool,
}

impl DurableLogWorker {
    /// Start the append thread. Durable events are forwarded to
    /// `durable_tx`; a dropped receiver is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::Io`] if the thread cannot be spawned.
    pub fn spawn(
        writer: PcesWriter,
        capacity: usize,
        durable_tx: Sender<PlatformEvent>,
    ) -> Result<Self, PcesError> {
        let streaming = writer.is_streaming();
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let handle = thread::Builder::new()
            .name("pces-log".into())
            .spawn(move || run(writer, &rx, &durable_tx))?;
        Ok(Self {
            tx,
            handle: Some(handle),
            streaming,
        })
    }

    /// Queue a command, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::WorkerStopped`] if the worker has exited; call
    /// [`shutdown`](Self::shutdown) to learn why.
    pub fn send(&self, command: LogCommand) -> Result<(), PcesError> {
        self.tx.send(command).map_err(|_| PcesError::WorkerStopped)
    }

    /// Stop the worker after it drains the queue, and wait for it.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the worker, or
    /// [`PcesError::WorkerPanicked`].
    pub fn shutdown(mut self) -> Result<WorkerReport, PcesError> {
        let _ = self.tx.send(LogCommand::Shutdown);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| PcesError::WorkerPanicked)?,
            None => Err(PcesError::WorkerStopped),
        }
    }
}

fn run(
    mut writer: PcesWriter,
    rx: &Receiver<LogCommand>,
    durable_tx: &Sender<PlatformEvent>,
) -> Result<WorkerReport, PcesError> {
    let mut report = WorkerReport::default();
    if let Err(err) = drain(&mut writer, rx, durable_tx, &mut report) {
        error!(error = %err, "event log worker stopping on fatal error");
        return Err(err);
    }
    report.tracker = writer.close()?;
    debug!(
        batches = report.batches,
        events = report.events,
        "event log worker stopped"
    );
    Ok(report)
}

fn drain(
    writer: &mut PcesWriter,
    rx: &Receiver<LogCommand>,
    durable_tx: &Sender<PlatformEvent>,
    report: &mut WorkerReport,
) -> Result<(), PcesError> {
    while let Ok(first) = rx.recv() {
        let mut pending = Vec::new();
        let mut stop = false;
        let mut next = Some(first);

        while let Some(command) = next.take() {
            match command {
                LogCommand::Events(events) => {
                    for event in &events {
                        writer.write_event(event)?;
                    }
                    pending.extend(events);
                }
                LogCommand::Window(window) => writer.update_event_window(window)?,
                LogCommand::Discontinuity(origin) => {
                    writer.register_discontinuity(origin)?;
                }
                LogCommand::BeginStreaming => writer.begin_streaming_new_events(),
                LogCommand::Shutdown => {
                    stop = true;
                    break;
                }
            }
            next = match rx.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
            };
        }

        if !pending.is_empty() {
            writer.sync()?;
            report.batches += 1;
            report.events += pending.len() as u64;
            for event in pending {
                // Consensus may have gone away during shutdown.
                let _ = durable_tx.send(event);
            }
        }
        if stop {
            break;
        }
    }
    Ok(())
}

impl DurableLog for DurableLogWorker {
    /// Hands events to the worker. They reach consensus through the worker's
    /// channel once durable, so nothing is returned here.
    fn persist(&mut self, events: Vec<PlatformEvent>) -> Result<Vec<PlatformEvent>, PcesError> {
        if !events.is_empty() {
            self.send(LogCommand::Events(events))?;
        }
        Ok(Vec::new())
    }

    fn update_event_window(&mut self, window: EventWindow) -> Result<(), PcesError> {
        self.send(LogCommand::Window(window))
    }

    fn register_discontinuity(&mut self, new_origin: Round) -> Result<(), PcesError> {
        self.send(LogCommand::Discontinuity(new_origin))
    }

    fn begin_streaming_new_events(&mut self) -> Result<(), PcesError> {
        self.send(LogCommand::BeginStreaming)?;
        self.streaming = true;
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }
}
