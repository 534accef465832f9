//! Append-only record of every prompt/response exchange.
//!
//! Each exchange is a plain text file under `<root>/<category>/`, addressed
//! by a monotonically increasing index kept in a sqlite sidecar. Records
//! are never mutated. The relative path is surfaced in log events so a log
//! line can link straight to the transcript.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::ai::types::ChatMessage;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub index: i64,
    pub category: String,
    /// Path relative to the recorder root, usable as a link target
    pub rel_path: String,
}

pub struct ConversationRecorder {
    root: PathBuf,
    index: Mutex<Connection>,
}

impl ConversationRecorder {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let conn = Connection::open(root.join("index.db"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS records (
                 idx        INTEGER PRIMARY KEY AUTOINCREMENT,
                 category   TEXT NOT NULL,
                 path       TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            root: root.to_path_buf(),
            index: Mutex::new(conn),
        })
    }

    /// Writes one exchange and returns its record. Blocking file IO;
    /// async callers hop onto a blocking thread.
    pub fn record(
        &self,
        category: &str,
        messages: &[ChatMessage],
        reply: Option<&str>,
    ) -> Result<ConversationRecord> {
        let conn = self.index.lock();
        conn.execute(
            "INSERT INTO records (category, path, created_at) VALUES (?1, '', ?2)",
            rusqlite::params![category, chrono::Local::now().to_rfc3339()],
        )?;
        let index = conn.last_insert_rowid();
        let rel_path = format!("{}/{}_{}.txt", category, category, index);
        conn.execute(
            "UPDATE records SET path = ?1 WHERE idx = ?2",
            rusqlite::params![rel_path, index],
        )?;
        drop(conn);

        let file_path = self.root.join(&rel_path);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let system = messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let user = messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let content = format!(
            "[system]\n\n{}\n\n[user]\n\n{}\n\n[reply]\n\n{}\n",
            system,
            user,
            reply.unwrap_or("<None>")
        );
        std::fs::write(&file_path, content)?;

        Ok(ConversationRecord {
            index,
            category: category.to_string(),
            rel_path,
        })
    }

    /// Looks up a record by index.
    pub fn get(&self, index: i64) -> Result<Option<ConversationRecord>> {
        let conn = self.index.lock();
        let mut stmt = conn.prepare("SELECT category, path FROM records WHERE idx = ?1")?;
        let mut rows = stmt.query([index])?;
        match rows.next()? {
            Some(row) => Ok(Some(ConversationRecord {
                index,
                category: row.get(0)?,
                rel_path: row.get(1)?,
            })),
            None => Ok(None),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_writes_sections_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ConversationRecorder::open(dir.path()).unwrap();

        let messages = [
            ChatMessage::system("You are an analyst."),
            ChatMessage::user("Analyze this."),
        ];
        let record = recorder
            .record("analysis", &messages, Some("{\"UUID\":\"a\"}"))
            .unwrap();
        assert_eq!(record.index, 1);
        assert_eq!(record.rel_path, "analysis/analysis_1.txt");

        let content = std::fs::read_to_string(dir.path().join(&record.rel_path)).unwrap();
        assert!(content.contains("[system]\n\nYou are an analyst."));
        assert!(content.contains("[user]\n\nAnalyze this."));
        assert!(content.contains("[reply]\n\n{\"UUID\":\"a\"}"));
    }

    #[test]
    fn test_indexes_are_monotonic_and_addressable() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ConversationRecorder::open(dir.path()).unwrap();
        let messages = [ChatMessage::system("s"), ChatMessage::user("u")];

        let first = recorder.record("analysis", &messages, None).unwrap();
        let second = recorder.record("recommendation", &messages, None).unwrap();
        assert!(second.index > first.index);

        let fetched = recorder.get(second.index).unwrap().unwrap();
        assert_eq!(fetched.category, "recommendation");
        assert_eq!(fetched.rel_path, second.rel_path);
        assert!(recorder.get(999).unwrap().is_none());
    }

    #[test]
    fn test_missing_reply_is_marked() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ConversationRecorder::open(dir.path()).unwrap();
        let record = recorder
            .record("analysis", &[ChatMessage::system("s"), ChatMessage::user("u")], None)
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join(&record.rel_path)).unwrap();
        assert!(content.contains("[reply]\n\n<None>"));
    }
}
