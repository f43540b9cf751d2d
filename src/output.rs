//! Output modes: human text or a single JSON document per command.
//!
//! Text goes through `anstream` so ANSI styling degrades automatically on
//! non-TTY output and under `NO_COLOR`.

use std::io::Write;

use clap::ValueEnum;

use crate::error::AtlasError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

/// Print a styled line in text mode.
pub fn print_text(line: &str) -> Result<(), AtlasError> {
    let mut stdout = anstream::stdout();
    writeln!(stdout, "{line}").map_err(|source| AtlasError::Io {
        context: "writing stdout".into(),
        source,
    })
}

/// Emit a command's single JSON document.
pub fn print_json(value: &serde_json::Value) -> Result<(), AtlasError> {
    let mut stdout = std::io::stdout();
    serde_json::to_writer_pretty(&mut stdout, value).map_err(|e| AtlasError::Io {
        context: "writing stdout".into(),
        source: std::io::Error::other(e),
    })?;
    writeln!(stdout).map_err(|source| AtlasError::Io {
        context: "writing stdout".into(),
        source,
    })
}

/// In JSON mode, print the error document and return the sentinel that makes
/// `main` exit silently with the right code. In text mode, pass through.
pub fn fail(format: OutputFormat, err: AtlasError) -> AtlasError {
    if format.is_json() {
        let code = err.exit_code();
        if print_json(&err.to_json()).is_ok() {
            return AtlasError::JsonErrorOutput { code };
        }
    }
    err
}
