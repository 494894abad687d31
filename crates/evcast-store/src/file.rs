use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use evcast_core::Event;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tracing::debug;

use crate::error::StoreError;
use crate::storage::Storage;

/// JSON array of events in a single file, rewritten whole on every persist.
///
/// Writes go to a sibling `.tmp` file which is synced and renamed over the
/// target, so readers only ever see a complete collection.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "events.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Four-space indented JSON, matching files written by earlier servers.
fn encode(events: &[Event]) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    events.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(buf)
}

impl Storage for JsonFileStorage {
    fn load(&self) -> Result<Vec<Event>, StoreError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "storage file not found, starting empty");
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display())))
    }

    fn persist(&self, events: &[Event]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let bytes = encode(events)?;
        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evcast_core::{EventFields, EventId};
    use serde_json::json;

    fn titled(seq: u64, title: &str) -> Event {
        let mut fields = EventFields::new();
        let _ = fields.insert("title".into(), json!(title));
        Event::new(EventId::from_raw(format!("evt_{seq}")), fields)
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path().join("events.json"));
        assert!(storage.load().unwrap().is_empty());
    }

    #[test]
    fn blank_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        fs::write(&path, "  \n").unwrap();
        assert!(JsonFileStorage::new(path).load().unwrap().is_empty());
    }

    #[test]
    fn persist_and_reload_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        let events = vec![titled(2, "b"), titled(1, "a"), titled(3, "c")];
        JsonFileStorage::new(&path).persist(&events).unwrap();

        let reloaded = JsonFileStorage::new(&path).load().unwrap();
        assert_eq!(reloaded, events);
    }

    #[test]
    fn writes_four_space_indent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        JsonFileStorage::new(&path).persist(&[titled(1, "Standup")]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("[\n    {\n        \"id\": \"evt_1\""), "got: {content}");
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path().join("events.json"));
        storage.persist(&[titled(1, "x")]).unwrap();
        assert!(!storage.tmp_path().exists());
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/events.json");
        JsonFileStorage::new(&path).persist(&[]).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        fs::write(&path, "{\"not\": \"an array\"}").unwrap();
        let err = JsonFileStorage::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn loads_files_written_by_hand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        fs::write(
            &path,
            r#"[{"title": "Legacy", "id": "evt_1700000000", "start": "2024-01-01"}]"#,
        )
        .unwrap();
        let events = JsonFileStorage::new(&path).load().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_str(), "evt_1700000000");
        assert_eq!(events[0].field("start"), Some(&json!("2024-01-01")));
    }

    #[test]
    fn unwritable_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("events.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupant"), "x").unwrap();
        let err = JsonFileStorage::new(&path).persist(&[]).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }
}
