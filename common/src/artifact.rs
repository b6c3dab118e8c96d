//! Artifact naming on the capture server and file-name sanitizing on the
//! client.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// What a session produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Video => "mp4",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

/// Unique artifact file name, e.g. `2024-05-01 10:00:00_002.jpg`.
///
/// The timestamp keeps recordings sortable; `seq` separates artifacts
/// produced within the same second.
pub fn artifact_name(kind: MediaKind, at: DateTime<Local>, seq: u32) -> String {
    format!(
        "{}_{:03}.{}",
        at.format("%Y-%m-%d %H:%M:%S"),
        seq,
        kind.extension()
    )
}

/// Characters rewritten to `+` in received file names.
const ILLEGAL: &[char] = &[':', '*', '?', '"', '<', '>', '|'];

/// Turn a remote artifact name into a safe local file name.
///
/// Drops any remote directory part (either separator style), rewrites
/// characters that are illegal on common filesystems, and strips control
/// characters. Names that end up empty or special fall back to
/// `artifact-<index>`.
pub fn sanitize_file_name(remote: &str, index: usize) -> String {
    let base = remote
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(remote);

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if ILLEGAL.contains(&c) { '+' } else { c })
        .collect();

    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        format!("artifact-{index}")
    } else {
        cleaned
    }
}

/// Where a received artifact is stored under `dir`.
pub fn local_path(dir: &Path, remote: &str, index: usize) -> PathBuf {
    dir.join(sanitize_file_name(remote, index))
}
