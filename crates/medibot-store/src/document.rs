//! Per-user JSON documents: export of stored records and import of the
//! legacy `user_storage/<user_id>.json` directory layout.

use crate::store::{StoreError, UserStore};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use medibot_core::{Conversation, Embedding, Message, UserRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk JSON shape of one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDocument {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub embeddings: Vec<Vec<f32>>,
    /// Legacy single-embedding field; read on import, never written.
    #[serde(default, skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: String,
    #[serde(default)]
    pub conversations: Vec<ConversationDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationDocument {
    pub timestamp: String,
    pub messages: Vec<Message>,
}

impl UserDocument {
    pub fn from_record(record: &UserRecord) -> Self {
        Self {
            user_id: record.id.clone(),
            name: record.name.clone(),
            embeddings: record.embeddings.iter().map(|e| e.values.clone()).collect(),
            embedding: None,
            created_at: record.created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            conversations: record
                .conversations
                .iter()
                .map(|c| ConversationDocument {
                    timestamp: c.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    messages: c.messages.clone(),
                })
                .collect(),
            image_base64: record.profile_image.as_ref().map(|img| STANDARD.encode(img)),
        }
    }

    pub fn into_record(self) -> Result<UserRecord, StoreError> {
        let mut vectors = self.embeddings;
        if let Some(single) = self.embedding {
            vectors.insert(0, single);
        }

        let conversations = self
            .conversations
            .into_iter()
            .map(|c| -> Result<Conversation, StoreError> {
                Ok(Conversation {
                    timestamp: parse_timestamp(&c.timestamp)?,
                    messages: c.messages,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let profile_image = self
            .image_base64
            .map(|b64| STANDARD.decode(b64.trim()))
            .transpose()
            .map_err(|e| StoreError::Validation(format!("bad image_base64: {e}")))?;

        Ok(UserRecord {
            id: self.user_id,
            name: self.name,
            embeddings: vectors.into_iter().map(Embedding::new).collect(),
            created_at: parse_timestamp(&self.created_at)?,
            conversations,
            profile_image,
        })
    }
}

/// Accepts RFC 3339 and naive ISO-8601 (`2024-05-01T10:20:30.123456`,
/// read as UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::Validation(format!("bad timestamp {raw:?}: {e}")))
}

/// Write `<dir>/<user_id>.json` for one stored user.
pub fn export_user(store: &UserStore, user_id: &str, dir: &Path) -> Result<PathBuf, StoreError> {
    let record = store.load(user_id)?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{user_id}.json"));
    let json = serde_json::to_string_pretty(&UserDocument::from_record(&record))?;
    std::fs::write(&path, json)?;
    tracing::info!(user_id, path = %path.display(), "exported user");
    Ok(path)
}

/// Outcome of a directory import.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: Vec<String>,
    /// (file name, reason)
    pub skipped: Vec<(String, String)>,
}

/// Import every `*.json` document in `dir`, in file-name order.
///
/// Unreadable or invalid documents and ids already present are skipped and
/// reported. Only a database failure aborts the import.
pub fn import_dir(store: &mut UserStore, dir: &Path) -> Result<ImportReport, StoreError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut report = ImportReport::default();
    for path in files {
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        match import_file(store, &path) {
            Ok(user_id) => report.imported.push(user_id),
            Err(e @ StoreError::Sqlite(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(file = %file, error = %e, "skipping document");
                report.skipped.push((file, e.to_string()));
            }
        }
    }

    tracing::info!(
        imported = report.imported.len(),
        skipped = report.skipped.len(),
        "import finished"
    );
    Ok(report)
}

fn import_file(store: &mut UserStore, path: &Path) -> Result<String, StoreError> {
    let raw = std::fs::read_to_string(path)?;
    let mut doc: UserDocument = serde_json::from_str(&raw)?;
    if doc.user_id.trim().is_empty() {
        // Legacy files are named after the user id.
        doc.user_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    let record = doc.into_record()?;
    store.insert_record(&record)?;
    Ok(record.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let a = parse_timestamp("2024-05-01T10:20:30.123456").unwrap();
        let b = parse_timestamp("2024-05-01T10:20:30.123456Z").unwrap();
        let c = parse_timestamp("2024-05-01T12:20:30.123456+02:00").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_export_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = UserStore::open_in_memory().unwrap();
        let alice = store
            .register("Alice", &emb(&[0.5, 0.25]), Some(&[1u8, 2, 3][..]))
            .unwrap();
        store
            .append_conversation(&alice.id, &[Message::bot("Hello Alice!"), Message::user("hi")])
            .unwrap();

        let path = export_user(&store, &alice.id, dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "P001.json");

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["user_id"], "P001");
        assert_eq!(json["name"], "Alice");
        assert_eq!(json["embeddings"], serde_json::json!([[0.5, 0.25]]));
        assert_eq!(json["image_base64"], "AQID");
        assert_eq!(
            json["conversations"][0]["messages"],
            serde_json::json!([["bot", "Hello Alice!"], ["user", "hi"]])
        );
        assert!(json.get("embedding").is_none());
    }

    #[test]
    fn test_export_unknown_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open_in_memory().unwrap();
        assert!(matches!(
            export_user(&store, "P404", dir.path()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_export_then_import_into_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = UserStore::open_in_memory().unwrap();
        let alice = source.register("Alice", &emb(&[0.1, 0.2]), None).unwrap();
        source.add_embedding(&alice.id, &emb(&[0.11, 0.2])).unwrap();
        source
            .append_conversation(&alice.id, &[Message::user("I have a cough")])
            .unwrap();
        export_user(&source, &alice.id, dir.path()).unwrap();

        let mut target = UserStore::open_in_memory().unwrap();
        let report = import_dir(&mut target, dir.path()).unwrap();
        assert_eq!(report.imported, vec!["P001".to_string()]);
        assert_eq!(target.load("P001").unwrap(), source.load("P001").unwrap());
    }

    #[test]
    fn test_import_legacy_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("user_1_101500.json"),
            r#"{
                "user_id": "user_1_101500",
                "name": "Alice",
                "embedding": [0.1, 0.2, 0.3],
                "created_at": "2025-02-03T10:15:00.123456",
                "conversations": [
                    {
                        "timestamp": "2025-02-03T10:20:00.000001",
                        "messages": [["Bot", "Hello Alice!"], ["You", "thanks"]]
                    }
                ],
                "image_base64": "AQID"
            }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("temp_image.jpg"), [0u8; 4]).unwrap();

        let mut store = UserStore::open_in_memory().unwrap();
        let report = import_dir(&mut store, dir.path()).unwrap();
        assert_eq!(report.imported, vec!["user_1_101500".to_string()]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "broken.json");

        let alice = store.load("user_1_101500").unwrap();
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.embeddings, vec![emb(&[0.1, 0.2, 0.3])]);
        assert_eq!(alice.profile_image, Some(vec![1, 2, 3]));
        assert_eq!(
            store.restore_conversation("user_1_101500", 0).unwrap(),
            vec![Message::bot("Hello Alice!"), Message::user("thanks")]
        );
    }

    #[test]
    fn test_import_skips_existing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = UserStore::open_in_memory().unwrap();
        let alice = store.register("Alice", &emb(&[0.1]), None).unwrap();
        export_user(&store, &alice.id, dir.path()).unwrap();

        let report = import_dir(&mut store, dir.path()).unwrap();
        assert!(report.imported.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(store.user_count().unwrap(), 1);
    }

    #[test]
    fn test_import_rejects_document_without_embeddings() {
        let doc = UserDocument {
            user_id: "P010".into(),
            name: "Ghost".into(),
            embeddings: vec![],
            embedding: None,
            created_at: "2025-01-01T00:00:00Z".into(),
            conversations: vec![],
            image_base64: None,
        };
        let record = doc.into_record().unwrap();
        let mut store = UserStore::open_in_memory().unwrap();
        assert!(matches!(
            store.insert_record(&record),
            Err(StoreError::Validation(_))
        ));
    }
}
