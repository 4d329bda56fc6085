pub mod command;
pub mod config;
pub mod job;
pub mod report;
pub mod service;

pub use command::{CommandSpec, ExecOutput};
pub use config::{MatrixConfig, MatrixPlan, RunOptions};
pub use job::{JobSpec, RunResult};
pub use report::{RunFailure, RunReport, ServiceReport, TeardownError};
pub use service::{ReadinessProbe, ServiceSpec, ServiceStatus};

/// Serde helpers for reporting `std::time::Duration` as fractional seconds.
pub(crate) mod time_serde {
    use std::time::Duration;

    use serde::Serializer;

    pub fn secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn opt_secs<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }
}
