use snafu::Snafu;

/// Errors surfaced by the core that do not already carry a SCSI status of
/// their own (those are encoded directly via [`crate::sense`] instead).
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum CoreError {
    #[snafu(display("invalid backend config string: {}", reason))]
    InvalidConfig { reason: String },

    #[snafu(display("worker pool for {} failed to start: {}", device, reason))]
    WorkerPoolStart { device: String, reason: String },

    #[snafu(display("lock subsystem {} is in an unexpected mode", device))]
    UnexpectedLockMode { device: String },

    #[snafu(display("exclusive lock acquisition raced with another owner on {}", device))]
    LockOwnerRace { device: String },
}

/// Loops through an error's source chain, formatting every level into a
/// single string. Used for CLI-facing error reporting.
pub trait VerboseError {
    fn verbose(&self) -> String;
}

impl<T> VerboseError for T
where
    T: std::error::Error,
{
    fn verbose(&self) -> String {
        let mut msg = format!("{self}");
        let mut source = self.source();
        while let Some(s) = source {
            msg = format!("{msg}: {s}");
            source = s.source();
        }
        msg
    }
}
