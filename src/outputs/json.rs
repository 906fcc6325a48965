//! JSON snapshot output for the renderer.
//!
//! The renderer reads a single file holding the ordered entry list:
//!
//! ```text
//! site/
//! ├── snapshot.json
//! └── images/
//!     ├── 3f2a….jpg
//!     └── …
//! ```
//!
//! Entries are written in snapshot order; `hero_img` values under `images/`
//! resolve against the directory holding `snapshot.json`.

use std::path::Path;
use tokio::fs;
use tracing::{error, info, instrument};

use crate::error::{Error, Result};
use crate::models::SnapshotEntry;

/// Write `entries` to `path` as a JSON array.
///
/// Parent directories are created as needed, and the file is replaced through
/// a temp file and rename so the renderer never reads a partial snapshot.
///
/// # Errors
///
/// Returns an error if serialization, directory creation or the write fails.
#[instrument(level = "info", skip_all, fields(path = %path.display(), entries = entries.len()))]
pub async fn write_snapshot(entries: &[SnapshotEntry], path: &Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(entries)?;

    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        info!(dir = %dir.display(), "Ensuring output directory exists");
        if let Err(e) = fs::create_dir_all(dir).await {
            error!(dir = %dir.display(), error = %e, "Failed to create output dir");
            return Err(Error::io(dir, e));
        }
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)
        .await
        .map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::io(path, e))?;
    info!("Wrote snapshot");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, pub_ts: i64) -> SnapshotEntry {
        SnapshotEntry {
            title: title.to_string(),
            link: format!("https://news.rthk.hk/{pub_ts}.htm"),
            pub_ts,
            pub_fmt: "01-14 10:00".to_string(),
            source: "rthk".to_string(),
            category: "news".to_string(),
            hero_img: "images/abc.jpg".to_string(),
            content: "<p>內容</p>".to_string(),
            search_text: format!("{title} 內容"),
        }
    }

    #[tokio::test]
    async fn test_write_snapshot_creates_dirs_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site").join("snapshot.json");
        let entries = vec![entry("新", 200), entry("舊", 100)];

        write_snapshot(&entries, &path).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let back: Vec<SnapshotEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, entries);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_snapshot_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        write_snapshot(&[entry("a", 1), entry("b", 2)], &path).await.unwrap();
        write_snapshot(&[], &path).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.trim(), "[]");
    }
}
