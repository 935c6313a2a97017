//! Error handling for this crate
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A Result containing a [HermesError] with its accompanying source
pub type HermesResult<T> = Result<T, HermesError>;

/// The classification of an error, independent of its underlying cause.
///
/// This mirrors the error kinds of §7 of the design doc. It is kept separate
/// from the `anyhow::Error` source so that health monitoring and CLI exit
/// codes can match on it without caring about the exact OS/library failure.
#[derive(Error, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum HermesErrorKind {
    #[error("configuration error")]
    Config,
    #[error("shared memory error")]
    SharedMemory,
    #[error("semaphore error")]
    Semaphore,
    #[error("module spawn failed")]
    ModuleSpawn,
    #[error("module crashed")]
    ModuleCrashed,
    #[error("barrier timeout")]
    BarrierTimeout,
    #[error("unknown signal")]
    UnknownSignal,
    #[error("signal is not writable")]
    NotWritable,
    #[error("wrong signal type")]
    WrongType,
    #[error("protocol error")]
    Protocol,
    #[error("unrecoverable internal error")]
    Panic,
}

/// Combination of a [HermesErrorKind] with an underlying `anyhow::Error`.
#[derive(Error, Debug)]
#[error("{kind}: {source:?}")]
pub struct HermesError {
    kind: HermesErrorKind,
    source: anyhow::Error,
}

impl HermesError {
    /// Creates a new [HermesError]
    pub fn new(kind: HermesErrorKind, source: anyhow::Error) -> Self {
        Self { kind, source }
    }

    /// Returns the [HermesErrorKind] of this error
    pub fn kind(&self) -> HermesErrorKind {
        self.kind
    }

    /// Returns the underlying `anyhow::Error`
    pub fn source_error(&self) -> &anyhow::Error {
        &self.source
    }
}

/// Converts a `Result` into a [HermesResult] by attaching a [HermesErrorKind].
pub trait ResultExt<T> {
    /// Attaches `kind` to this result's error, converting it into a [HermesError].
    fn typ(self, kind: HermesErrorKind) -> HermesResult<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for Result<T, E> {
    fn typ(self, kind: HermesErrorKind) -> HermesResult<T> {
        self.map_err(|e| HermesError {
            kind,
            source: e.into(),
        })
    }
}

/// Shorthand macro to build and return a [HermesError], in the style of
/// `anyhow::bail!`.
#[macro_export]
macro_rules! problem {
    ($kind:expr, $($tail:tt)*) => {{
        #[allow(unused_imports)]
        use $crate::error::HermesErrorKind::*;
        let problem = ::anyhow::anyhow!($($tail)*);
        return $crate::error::HermesResult::Err(
            $crate::error::HermesError::new($kind, problem)
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn problem_manual() -> HermesResult<()> {
        let extra = "detail";
        let problem = anyhow!("a {extra} description");
        Err(HermesError::new(HermesErrorKind::Panic, problem))
    }

    fn problem_macro() -> HermesResult<()> {
        let extra = "detail";
        problem!(Panic, "a {extra} description");
    }

    #[test]
    fn problem_macro_matches_manual() {
        assert_eq!(
            problem_manual().unwrap_err().to_string(),
            problem_macro().unwrap_err().to_string()
        );
    }
}
