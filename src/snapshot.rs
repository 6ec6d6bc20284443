//! On-disk snapshots of pending telemessages
//!
//! Each pending message is persisted as one JSON file named
//! `YYYYMMDDTHHMMSSffffff_subId_<N>.json` (creation time in UTC plus the
//! process-unique sub id). The payload bytes are hex-encoded inside the
//! record since they may be compressed binary. Files written by one instance
//! reload into equivalent messages in a future instance.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::telemessage::Telemessage;

static FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{8}T\d{6})(\d{6})_subId_(\d+)\.json$").expect("valid snapshot filename regex")
});

#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    parameters: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    data_hex: String,
    creation_dt: DateTime<Utc>,
    sub_id: u64,
}

/// A message restored from disk
pub(crate) struct RecoveredMessage {
    pub message: Telemessage,
    pub creation_dt: DateTime<Utc>,
    pub sub_id: u64,
}

pub(crate) fn snapshot_filename(creation_dt: DateTime<Utc>, sub_id: u64) -> String {
    format!("{}_subId_{}.json", creation_dt.format("%Y%m%dT%H%M%S%6f"), sub_id)
}

/// Persist one message. Writing is skipped when the target file exists: the
/// filename is derived from immutable identity, so the content cannot have
/// changed.
pub(crate) fn write_snapshot(
    folder: &Path,
    message: &Telemessage,
    creation_dt: DateTime<Utc>,
    sub_id: u64,
) -> std::io::Result<()> {
    std::fs::create_dir_all(folder)?;
    let path = folder.join(snapshot_filename(creation_dt, sub_id));
    if path.exists() {
        return Ok(());
    }
    let record = SnapshotRecord {
        parameters: message.parameters.clone(),
        headers: message.headers.clone(),
        data_hex: hex::encode(&message.data),
        creation_dt,
        sub_id,
    };
    let json = serde_json::to_vec(&record).map_err(std::io::Error::other)?;
    debug!(path = %path.display(), "Writing telemessage snapshot");
    std::fs::write(path, json)
}

fn parse_filename(name: &str) -> Option<(DateTime<Utc>, u64)> {
    let captures = FILENAME_RE.captures(name)?;
    let whole = NaiveDateTime::parse_from_str(&captures[1], "%Y%m%dT%H%M%S").ok()?;
    let micros: u32 = captures[2].parse().ok()?;
    let sub_id: u64 = captures[3].parse().ok()?;
    let dt = Utc.from_utc_datetime(&whole) + chrono::Duration::microseconds(micros as i64);
    Some((dt, sub_id))
}

/// Load every snapshot in the folder, sorted by filename. Malformed files
/// are logged and skipped; an unreadable folder yields an empty list.
pub(crate) fn load_snapshots(folder: &Path) -> Vec<RecoveredMessage> {
    let entries = match std::fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(folder = %folder.display(), error = %e, "Unable to read snapshot folder");
            return Vec::new();
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| FILENAME_RE.is_match(name))
        .collect();
    names.sort();

    let mut recovered = Vec::new();
    for name in names {
        let Some((creation_dt, sub_id)) = parse_filename(&name) else {
            warn!(file = %name, "Skipping snapshot with unparsable filename");
            continue;
        };
        let path = folder.join(&name);
        let record: SnapshotRecord = match std::fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(anyhow::Error::from))
        {
            Ok(record) => record,
            Err(e) => {
                warn!(file = %name, error = %e, "Skipping malformed snapshot file");
                continue;
            }
        };
        let data = match hex::decode(&record.data_hex) {
            Ok(data) => data,
            Err(e) => {
                warn!(file = %name, error = %e, "Skipping snapshot with malformed payload");
                continue;
            }
        };
        let mut message = Telemessage::new(record.parameters, Bytes::from(data));
        message.headers = record.headers;
        recovered.push(RecoveredMessage {
            message,
            creation_dt,
            sub_id,
        });
    }
    recovered
}

/// Delete snapshot files that no longer correspond to a pending message.
/// Only files matching the snapshot naming pattern are touched.
pub(crate) fn prune_snapshots(folder: &Path, keep: &HashSet<String>) {
    let entries = match std::fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if FILENAME_RE.is_match(&name) && !keep.contains(&name) {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!(file = %name, error = %e, "Unable to remove stale snapshot");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn message() -> Telemessage {
        Telemessage::new(
            BTreeMap::from([("db".to_string(), "d".to_string())]),
            Bytes::from_static(b"m f=1i 1000000000"),
        )
        .with_header("Content-Encoding", "gzip")
    }

    fn creation() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 1, 12, 30, 45).unwrap()
            + chrono::Duration::microseconds(123456)
    }

    #[test]
    fn test_filename_format() {
        assert_eq!(
            snapshot_filename(creation(), 7),
            "20230601T123045123456_subId_7.json"
        );
    }

    #[test]
    fn test_write_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let msg = message();
        write_snapshot(dir.path(), &msg, creation(), 7).unwrap();

        let recovered = load_snapshots(dir.path());
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].sub_id, 7);
        assert_eq!(recovered[0].creation_dt, creation());
        assert_eq!(recovered[0].message, msg);
    }

    #[test]
    fn test_existing_file_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(snapshot_filename(creation(), 7));
        std::fs::write(&path, b"sentinel").unwrap();

        write_snapshot(dir.path(), &message(), creation(), 7).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"sentinel");
    }

    #[test]
    fn test_malformed_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), &message(), creation(), 1).unwrap();
        std::fs::write(
            dir.path().join("20230601T123045123456_subId_2.json"),
            b"not json",
        )
        .unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"ignore me").unwrap();

        let recovered = load_snapshots(dir.path());
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].sub_id, 1);
    }

    #[test]
    fn test_unreadable_folder_yields_empty() {
        let recovered = load_snapshots(Path::new("/nonexistent/snapshot/folder"));
        assert!(recovered.is_empty());
    }

    #[test]
    fn test_prune_keeps_only_pending() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), &message(), creation(), 1).unwrap();
        write_snapshot(dir.path(), &message(), creation(), 2).unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();

        let keep = HashSet::from([snapshot_filename(creation(), 2)]);
        prune_snapshots(dir.path(), &keep);

        assert!(!dir.path().join(snapshot_filename(creation(), 1)).exists());
        assert!(dir.path().join(snapshot_filename(creation(), 2)).exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_load_order_follows_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let later = creation() + chrono::Duration::seconds(10);
        write_snapshot(dir.path(), &message(), later, 2).unwrap();
        write_snapshot(dir.path(), &message(), creation(), 1).unwrap();

        let recovered = load_snapshots(dir.path());
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].sub_id, 1);
        assert_eq!(recovered[1].sub_id, 2);
    }
}
