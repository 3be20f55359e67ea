//! Plain-text artifacts written during a run.
//!
//! The commands and manual-steps logs are append-only; the detected-services
//! and patterns logs are rewritten in full whenever their content changes.

use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// Output directory layout for one host.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub scans: PathBuf,
    pub xml: PathBuf,
    pub logs: PathBuf,
    pub exploit: PathBuf,
    pub privesc: PathBuf,
    pub loot: PathBuf,
}

impl RunPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let scans = root.join("scans");
        Self {
            xml: scans.join("xml"),
            logs: scans.join("logs"),
            exploit: root.join("exploit"),
            privesc: root.join("priv"),
            loot: root.join("loot"),
            scans,
            root,
        }
    }

    pub fn directories(&self) -> [&Path; 6] {
        [
            self.scans.as_path(),
            self.xml.as_path(),
            self.logs.as_path(),
            self.exploit.as_path(),
            self.privesc.as_path(),
            self.loot.as_path(),
        ]
    }

    /// Create every directory of the layout that does not exist yet.
    pub async fn create(&self) -> Result<()> {
        for dir in self.directories() {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    pub fn commands_log(&self) -> PathBuf {
        self.logs.join("commands.log")
    }

    pub fn services_log(&self) -> PathBuf {
        self.logs.join("detected_services.log")
    }

    pub fn manual_log(&self) -> PathBuf {
        self.logs.join("manual_steps.log")
    }

    pub fn patterns_log(&self) -> PathBuf {
        self.logs.join("patterns.log")
    }

    pub fn summary_json(&self) -> PathBuf {
        self.logs.join("summary.json")
    }
}

/// Append `text` to `path`, creating it if needed.
pub async fn append(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Replace the content of `path` with `text`.
pub async fn rewrite(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text).await?;
    Ok(())
}

/// Truncate `path` to empty.
pub async fn clear(path: &Path) -> Result<()> {
    rewrite(path, "").await
}

/// Commands-log entry: issuing unit, timestamp, executed command text.
pub fn command_entry(unit: u64, timestamp: &str, command: &str) -> String {
    format!("[*] (Unit {unit}) {timestamp} {command}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn layout_under_root() {
        let p = RunPaths::new("/r/10.0.0.1");
        assert_eq!(p.xml, PathBuf::from("/r/10.0.0.1/scans/xml"));
        assert_eq!(p.privesc, PathBuf::from("/r/10.0.0.1/priv"));
        assert_eq!(
            p.commands_log(),
            PathBuf::from("/r/10.0.0.1/scans/logs/commands.log")
        );
    }

    #[tokio::test]
    async fn append_rewrite_and_clear() {
        let dir = TempDir::new().unwrap();
        let paths = RunPaths::new(dir.path().join("host"));
        paths.create().await.unwrap();
        assert!(paths.directories().iter().all(|d| d.is_dir()));

        let log = paths.commands_log();
        append(&log, "a\n").await.unwrap();
        append(&log, "b\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "a\nb\n");

        rewrite(&log, "c\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "c\n");

        clear(&log).await.unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "");
    }

    #[test]
    fn command_entry_format() {
        assert_eq!(
            command_entry(3, "2024-01-01T00:00:00Z", "sudo nmap x"),
            "[*] (Unit 3) 2024-01-01T00:00:00Z sudo nmap x\n\n"
        );
    }
}
