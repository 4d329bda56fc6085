use serde::Serialize;

use super::command::CommandSpec;

/// Lifecycle state of one service. Transitions are
/// `Unstarted -> Starting -> {Ready | FailedToStart} -> Stopped`;
/// no transition skips a state, and `Stopped` is reachable from
/// `Starting`, `Ready`, and `FailedToStart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceStatus {
    Unstarted,
    Starting,
    Ready,
    FailedToStart,
    Stopped,
}

/// How to decide a service is able to accept requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// Ready once the command exits 0 (e.g. `pg_isready`).
    Command { command: CommandSpec },
    /// Ready once a TCP connection is accepted.
    Tcp { host: String, port: u16 },
    /// Ready once the command's output matches the regex
    /// (e.g. `docker logs` against "ready to accept connections").
    LogPattern { command: CommandSpec, pattern: String },
}

/// One ephemeral dependency service declared by the caller.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unique across the run; duplicates are rejected before anything starts.
    pub name: String,
    pub start: CommandSpec,
    pub stop: CommandSpec,
    pub readiness: ReadinessProbe,
    /// Run the stop command first (failure ignored) to clear a stale
    /// instance left over under the same name. Off by default: a name
    /// collision then surfaces as a start failure.
    pub stop_before_start: bool,
}

impl ServiceSpec {
    pub fn new(
        name: impl Into<String>,
        start: CommandSpec,
        stop: CommandSpec,
        readiness: ReadinessProbe,
    ) -> Self {
        Self {
            name: name.into(),
            start,
            stop,
            readiness,
            stop_before_start: false,
        }
    }
}
