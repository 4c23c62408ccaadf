pub mod store;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::ArtifactStore;

/// Files the orchestrator keeps in a run directory that are state, not evidence.
pub const STATE_FILES: [&str; 2] = ["run_context.json", "flow_run.json"];

/// Classification of an artifact, which also decides its subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Screenshot,
    Video,
    Log,
    Report,
    Other,
}

impl ArtifactKind {
    pub const SUBDIRS: [&'static str; 4] = ["screenshots", "videos", "logs", "reports"];

    /// Subdirectory under the run root; `Other` lives in the root itself.
    pub fn subdir(&self) -> Option<&'static str> {
        match self {
            ArtifactKind::Screenshot => Some("screenshots"),
            ArtifactKind::Video => Some("videos"),
            ArtifactKind::Log => Some("logs"),
            ArtifactKind::Report => Some("reports"),
            ArtifactKind::Other => None,
        }
    }

    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" => ArtifactKind::Screenshot,
            "webm" | "mp4" | "mov" | "avi" | "mkv" => ArtifactKind::Video,
            "log" | "txt" | "har" => ArtifactKind::Log,
            "json" | "html" | "htm" | "xml" | "csv" | "pdf" | "md" => ArtifactKind::Report,
            _ => ArtifactKind::Other,
        }
    }

    pub fn classify(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(ArtifactKind::Other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "screenshot",
            ArtifactKind::Video => "video",
            ArtifactKind::Log => "log",
            ArtifactKind::Report => "report",
            ArtifactKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An artifact as found on disk. Never stored separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub run_id: String,
    pub name: String,
    /// Path relative to the run directory, `/`-separated.
    pub path: String,
    pub size: u64,
    pub kind: ArtifactKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStats {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub runs: u64,
    pub files: u64,
    pub bytes: u64,
    pub by_kind: BTreeMap<ArtifactKind, KindStats>,
}

/// Run ids become path segments, so only `[A-Za-z0-9_-]{1,128}` is accepted.
pub fn is_valid_run_id(run_id: &str) -> bool {
    !run_id.is_empty()
        && run_id.len() <= 128
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_extension() {
        assert_eq!(ArtifactKind::classify(Path::new("a.PNG")), ArtifactKind::Screenshot);
        assert_eq!(ArtifactKind::classify(Path::new("rec.webm")), ArtifactKind::Video);
        assert_eq!(ArtifactKind::classify(Path::new("console.log")), ArtifactKind::Log);
        assert_eq!(ArtifactKind::classify(Path::new("report.json")), ArtifactKind::Report);
        assert_eq!(ArtifactKind::classify(Path::new("blob.bin")), ArtifactKind::Other);
        assert_eq!(ArtifactKind::classify(Path::new("noext")), ArtifactKind::Other);
    }

    #[test]
    fn run_id_charset() {
        assert!(is_valid_run_id("r1"));
        assert!(is_valid_run_id("3f2b-aa_01"));
        assert!(!is_valid_run_id(""));
        assert!(!is_valid_run_id("../etc"));
        assert!(!is_valid_run_id("a/b"));
        assert!(!is_valid_run_id(&"x".repeat(129)));
    }
}
