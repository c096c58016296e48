use std::fmt;

/// Machine-readable error codes for operators and supervising processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    InvalidConfig,
    MalformedEvent,
    EventTooLarge,
    InvalidEvent,
    WindowRegression,
    LogWriteFailed,
    LogOutOfBounds,
    LogSequenceGap,
    CorruptLogFile,
    UncoveredRange,
    InvalidLogFileName,
    LogWorkerStopped,
    LockContention,
    ReplayUnhealthy,
    ReplayWhileStreaming,
    PipelineStageFailed,
    MissingSigner,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::InvalidConfig => "E1002",
            Self::MalformedEvent => "E2001",
            Self::EventTooLarge => "E2002",
            Self::InvalidEvent => "E2003",
            Self::WindowRegression => "E2004",
            Self::LogWriteFailed => "E3001",
            Self::LogOutOfBounds => "E3002",
            Self::LogSequenceGap => "E3003",
            Self::CorruptLogFile => "E3004",
            Self::UncoveredRange => "E3005",
            Self::InvalidLogFileName => "E3006",
            Self::LogWorkerStopped => "E3007",
            Self::LockContention => "E5001",
            Self::ReplayUnhealthy => "E6001",
            Self::ReplayWhileStreaming => "E6002",
            Self::PipelineStageFailed => "E7001",
            Self::MissingSigner => "E7002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::InvalidConfig => "Invalid configuration value",
            Self::MalformedEvent => "Malformed serialized event",
            Self::EventTooLarge => "Serialized event exceeds size limit",
            Self::InvalidEvent => "Event failed internal validation",
            Self::WindowRegression => "Event window moved backwards",
            Self::LogWriteFailed => "Event log write failed",
            Self::LogOutOfBounds => "Event outside log file bounds",
            Self::LogSequenceGap => "Gap in event log sequence numbers",
            Self::CorruptLogFile => "Corrupt event log file",
            Self::UncoveredRange => "Required rounds missing from event log",
            Self::InvalidLogFileName => "Unparseable event log file name",
            Self::LogWorkerStopped => "Event log worker stopped",
            Self::LockContention => "Lock contention",
            Self::ReplayUnhealthy => "Replay exceeded its time budget",
            Self::ReplayWhileStreaming => "Replay requested after streaming began",
            Self::PipelineStageFailed => "Graph pipeline stage failed",
            Self::MissingSigner => "No signer for event creator",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in the pces config file and retry."),
            Self::InvalidConfig => Some("Spans must be non-zero and overlap factors at least 1.0."),
            Self::MalformedEvent | Self::EventTooLarge | Self::InvalidEvent => None,
            Self::WindowRegression => {
                Some("Consensus must only raise the ancient threshold; check the round feed.")
            }
            Self::LogWriteFailed => {
                Some("Check disk space and permissions. The node must not continue without a log.")
            }
            Self::LogOutOfBounds => None,
            Self::LogSequenceGap => Some(
                "Restore the missing files, or set `log.permit_gaps = true` to accept the gap.",
            ),
            Self::CorruptLogFile => Some("The file was moved to the recycle directory."),
            Self::UncoveredRange => Some(
                "Restore the recycled files or load a newer saved state before restarting.",
            ),
            Self::InvalidLogFileName => None,
            Self::LogWorkerStopped => Some("Inspect the worker error returned on shutdown."),
            Self::LockContention => {
                Some("Another process is writing this event log directory.")
            }
            Self::ReplayUnhealthy => {
                Some("Raise `intake.replay_time_budget_ms` or prune the event log.")
            }
            Self::ReplayWhileStreaming => {
                Some("Replay before calling `begin_streaming_new_events`.")
            }
            Self::PipelineStageFailed => None,
            Self::MissingSigner => Some("Provide a signing key for every creator in the graph."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
