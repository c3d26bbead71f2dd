// Consistent exit codes for the caseroom CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/configuration error
//   11 = authentication error
//   13 = network error

use std::process;

use crate::client::MissingCredential;

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Auth = 11,
    Network = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if cause.downcast_ref::<MissingCredential>().is_some() {
                return Self::Auth;
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::TimedOut => Self::Network,
                    _ => Self::Error,
                };
            }
        }

        let msg = format!("{err:#}");
        if msg.contains("no server configured") || msg.contains("server_url must use wss") {
            return Self::Usage;
        }
        if msg.contains("timed out") || msg.contains("connection lost") {
            return Self::Network;
        }

        Self::Error
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_values() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Error.code(), 1);
        assert_eq!(ExitCode::Usage.code(), 2);
        assert_eq!(ExitCode::Auth.code(), 11);
        assert_eq!(ExitCode::Network.code(), 13);
    }

    #[test]
    fn from_error_connection_refused_is_network() {
        let err = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);
    }

    #[test]
    fn from_error_timeout_message_is_network() {
        let err = anyhow::anyhow!("timed out waiting for a reply");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Network);
    }

    #[test]
    fn from_error_missing_server_is_usage() {
        let err = anyhow::anyhow!("no server configured: pass --server");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);
    }

    #[test]
    fn from_error_generic_is_error() {
        let err = anyhow::anyhow!("something went wrong");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Error);
    }
}
