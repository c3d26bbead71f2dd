// Output format auto-detection for the CLI.
//
// TTY → human-readable text. Piped/redirected → structured JSON.
// `--json` flag forces JSON output regardless of terminal.

use crate::client::MissingCredential;

use serde::Serialize;
use std::io::{self, IsTerminal, Write};

const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text.
    Human,
    /// Machine-readable JSON (one object per line).
    Json,
}

impl OutputFormat {
    /// Auto-detect format: JSON if `--json` was passed or stdout is not a TTY.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    /// Testable variant that takes an explicit `is_tty` flag.
    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

/// Write a value to stdout in the selected format.
pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    let mut out = io::stdout().lock();
    write_output(&mut out, format, value, human_fn)?;
    out.flush()
}

/// Write a value to a provided writer (useful for testing).
///
/// An empty human rendering writes nothing, so streaming commands can skip
/// updates that have nothing to say.
pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => {
            let text = human_fn(value);
            if text.is_empty() {
                return Ok(());
            }
            writeln!(writer, "{text}")
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

/// Write an error to stderr in the selected format.
pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    let mut err = io::stderr().lock();
    match format {
        OutputFormat::Human => {
            let line =
                render_human_stderr_line("error", message, io::stderr().is_terminal(), ANSI_RED);
            let _ = writeln!(err, "{line}");
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "error": {
                    "code": code,
                    "message": message,
                }
            });
            let _ = serde_json::to_writer(&mut err, &obj);
            let _ = writeln!(err);
        }
    }
}

/// Write a warning to stderr in the selected format.
pub fn print_warning(format: OutputFormat, code: &str, message: &str) {
    let mut err = io::stderr().lock();
    match format {
        OutputFormat::Human => {
            let line = render_human_stderr_line(
                "warning",
                message,
                io::stderr().is_terminal(),
                ANSI_YELLOW,
            );
            let _ = writeln!(err, "{line}");
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "warning": {
                    "code": code,
                    "message": message,
                }
            });
            let _ = serde_json::to_writer(&mut err, &obj);
            let _ = writeln!(err);
        }
    }
}

/// Print a mapped, actionable error for a command failure.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (&'static str, String) {
    let message = format!("{error:#}");
    let lower = message.to_ascii_lowercase();

    if error.downcast_ref::<MissingCredential>().is_some() {
        return ("AUTH_MISSING", format!("{message}. Sign in and export the token first."));
    }

    if lower.contains("no server configured") {
        return (
            "CONFIG_MISSING",
            "No server configured. Pass --server wss://<host> or set server_url in \
             ~/.caseroom/config.toml"
                .to_string(),
        );
    }

    if lower.contains("server_url must use wss") || lower.contains("unusable server url") {
        return ("INVALID_SERVER_URL", message);
    }

    if lower.contains("timed out") {
        return (
            "NETWORK_TIMEOUT",
            format!("{message}. Check the server URL and your network connection."),
        );
    }

    if lower.contains("connection lost") || lower.contains("could not connect") {
        return ("CONNECTION_LOST", message);
    }

    ("ERROR", message)
}

fn render_human_stderr_line(label: &str, message: &str, is_tty: bool, color: &str) -> String {
    if is_tty {
        format!("{color}{label}:{ANSI_RESET} {message}")
    } else {
        format!("{label}: {message}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_tty_returns_human() {
        assert_eq!(OutputFormat::detect_from_terminal(true), OutputFormat::Human);
    }

    #[test]
    fn detect_pipe_returns_json() {
        assert_eq!(OutputFormat::detect_from_terminal(false), OutputFormat::Json);
    }

    #[test]
    fn detect_json_flag_overrides_tty() {
        assert_eq!(OutputFormat::detect(true), OutputFormat::Json);
    }

    #[test]
    fn write_output_human_format() {
        #[derive(Serialize)]
        struct Info {
            name: String,
        }
        let info = Info { name: "alice".into() };
        let mut buf = Vec::new();
        write_output(&mut buf, OutputFormat::Human, &info, |i| format!("Name: {}", i.name))
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "Name: alice\n");
    }

    #[test]
    fn write_output_human_skips_empty_text() {
        #[derive(Serialize)]
        struct Empty {}
        let mut buf = Vec::new();
        write_output(&mut buf, OutputFormat::Human, &Empty {}, |_| String::new()).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn write_output_json_format() {
        #[derive(Serialize)]
        struct Info {
            name: String,
            count: u32,
        }
        let info = Info { name: "bob".into(), count: 42 };
        let mut buf = Vec::new();
        write_output(&mut buf, OutputFormat::Json, &info, |_| {
            unreachable!("human_fn should not be called in JSON mode")
        })
        .unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert!(output.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(parsed["name"], "bob");
        assert_eq!(parsed["count"], 42);
    }

    #[test]
    fn print_error_does_not_panic() {
        print_error(OutputFormat::Human, "TEST_ERR", "something broke");
        print_error(OutputFormat::Json, "TEST_ERR", "something broke");
    }

    #[test]
    fn render_human_error_uses_color_for_tty() {
        let line = render_human_stderr_line("error", "boom", true, ANSI_RED);
        assert!(line.contains(ANSI_RED));
        assert!(line.contains(ANSI_RESET));
        assert!(line.contains("boom"));
    }

    #[test]
    fn render_human_warning_without_tty_is_plain() {
        let line = render_human_stderr_line("warning", "careful", false, ANSI_YELLOW);
        assert_eq!(line, "warning: careful");
    }

    #[test]
    fn print_warning_json_format() {
        print_warning(OutputFormat::Json, "WARN", "heads up");
    }

    #[test]
    fn actionable_error_missing_server() {
        let err = anyhow::anyhow!("no server configured: pass --server or set server_url");
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "CONFIG_MISSING");
        assert!(message.contains("~/.caseroom/config.toml"));
    }

    #[test]
    fn actionable_error_timeout() {
        let err = anyhow::anyhow!("timed out waiting for the case stream to connect");
        let (code, message) = actionable_error(&err);
        assert_eq!(code, "NETWORK_TIMEOUT");
        assert!(message.contains("Check the server URL"));
    }

    #[test]
    fn actionable_error_insecure_url() {
        let err = anyhow::anyhow!(
            "server_url must use wss (ws is allowed only for localhost testing)"
        );
        assert_eq!(actionable_error(&err).0, "INVALID_SERVER_URL");
    }

    #[test]
    fn actionable_error_fallback_keeps_message() {
        let err = anyhow::anyhow!("something went wrong");
        assert_eq!(actionable_error(&err), ("ERROR", "something went wrong".to_string()));
    }
}
