use std::path::PathBuf;

use thiserror::Error;

/// Failures that end up persisted as a stream's error text.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("source file not found: {}", path.display())]
    ResourceMissing { path: PathBuf },

    #[error("failed to spawn {program}: {reason}")]
    SpawnFailure { program: String, reason: String },

    #[error("{}", describe_exit(*code, *signal))]
    AbnormalExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("log file {}: {reason}", path.display())]
    LogSink { path: PathBuf, reason: String },
}

fn describe_exit(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("relay exited with code {}", code),
        (None, Some(signal)) => format!("relay terminated by signal {}", signal),
        (None, None) => "relay exited abnormally".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_text() {
        let e = RelayError::ResourceMissing {
            path: PathBuf::from("/media/show.mp4"),
        };
        assert_eq!(e.to_string(), "source file not found: /media/show.mp4");

        let e = RelayError::AbnormalExit {
            code: Some(1),
            signal: None,
        };
        assert_eq!(e.to_string(), "relay exited with code 1");

        let e = RelayError::AbnormalExit {
            code: None,
            signal: Some(9),
        };
        assert_eq!(e.to_string(), "relay terminated by signal 9");
    }
}
