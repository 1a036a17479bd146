// Step-by-step debug log of each chat query

use chrono::Local;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const HEADER: &str = "MCP stream client debug log";

/// Appends prompts, model output and tool traffic to a file. Write
/// failures are logged and otherwise ignored.
pub struct ContextLog {
    path: Option<PathBuf>,
}

impl ContextLog {
    /// Truncate `path` and write the header
    pub fn create(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let result = File::create(&path)
            .and_then(|mut f| writeln!(f, "{}\n{}\n", HEADER, "=".repeat(50)));
        if let Err(e) = result {
            warn!("Cannot write context log '{}': {}", path.display(), e);
        }
        Self { path: Some(path) }
    }

    /// A log that records nothing
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record<T: Serialize + ?Sized>(&self, step: &str, data: &T) {
        let Some(path) = &self.path else { return };
        if let Err(e) = Self::append(path, step, data) {
            warn!("Cannot write context log '{}': {}", path.display(), e);
        }
    }

    fn append<T: Serialize + ?Sized>(path: &Path, step: &str, data: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        write!(
            file,
            "\n[{}] {}\n{}\n{}\n{}\n",
            timestamp,
            step,
            "-".repeat(40),
            json,
            "=".repeat(50)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn test_header_and_steps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.log");
        fs::write(&path, "stale content").unwrap();

        let log = ContextLog::create(&path);
        log.record("user input", &json!({"user_input": "北京天气"}));
        log.record("tool results", &json!({"tool_results": []}));

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(HEADER));
        assert!(!content.contains("stale content"));
        assert!(content.contains("] user input\n"));
        // Non-ASCII text stays readable
        assert!(content.contains("北京天气"));
        assert_eq!(content.matches(&"-".repeat(40)).count(), 2);
    }

    #[test]
    fn test_unwritable_path_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let log = ContextLog::create(dir.path().join("missing").join("debug.log"));
        log.record("step", &json!({"a": 1}));

        ContextLog::disabled().record("step", &json!({}));
    }
}
