//! Stable exit codes

use flowkeeper_runtime::{ErrorKind, EXIT_CODE_INTERRUPTED};
use serde::{Deserialize, Serialize};

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// No errors reported
    Success = 0,
    /// The batch ran and reported at least one error
    ErrorsReported = 1,
    /// Bad usage, bad configuration, or an unusable cache/state directory
    Framework = 2,
    /// A termination signal arrived
    Interrupted = EXIT_CODE_INTERRUPTED,
}

impl ExitCode {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::ErrorsReported),
            2 => Some(ExitCode::Framework),
            EXIT_CODE_INTERRUPTED => Some(ExitCode::Interrupted),
            _ => None,
        }
    }

    /// Exit code for a framework-level error that aborted a command
    pub fn for_error_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Interrupted => ExitCode::Interrupted,
            // A transient failure escaping the batch still means errors were seen
            ErrorKind::Transient => ExitCode::ErrorsReported,
            ErrorKind::InvalidArgument | ErrorKind::ResourceUnavailable => ExitCode::Framework,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_codes() {
        for code in [
            ExitCode::Success,
            ExitCode::ErrorsReported,
            ExitCode::Framework,
            ExitCode::Interrupted,
        ] {
            assert_eq!(ExitCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ExitCode::Interrupted.as_i32(), 130);
        assert_eq!(ExitCode::from_i32(42), None);
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            ExitCode::for_error_kind(ErrorKind::Interrupted),
            ExitCode::Interrupted
        );
        assert_eq!(
            ExitCode::for_error_kind(ErrorKind::ResourceUnavailable),
            ExitCode::Framework
        );
    }
}
