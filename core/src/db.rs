use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use rusqlite::{Connection, params};

use crate::storage::KeyValueStore;

/// Sqlite-backed local store. Plays the part browser `localStorage` plays for
/// the web client: one flat namespace of string keys and string values.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS local_storage (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }
}

impl KeyValueStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM local_storage WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO local_storage (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM local_storage WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        // substr comparison instead of LIKE so '_' and '%' in keys match literally
        let mut stmt = self.conn.prepare(
            "SELECT key FROM local_storage
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_overwrite() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get("fittrack.meal_plans").unwrap().is_none());

        db.set("fittrack.meal_plans", "[]").unwrap();
        assert_eq!(db.get("fittrack.meal_plans").unwrap().as_deref(), Some("[]"));

        db.set("fittrack.meal_plans", "[1]").unwrap();
        assert_eq!(db.get("fittrack.meal_plans").unwrap().as_deref(), Some("[1]"));
        let rows: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM local_storage", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_remove() {
        let db = Database::open_in_memory().unwrap();
        db.set("a", "1").unwrap();
        assert!(db.remove("a").unwrap());
        assert!(!db.remove("a").unwrap());
        assert!(db.get("a").unwrap().is_none());
    }

    #[test]
    fn test_keys_with_prefix_is_literal() {
        let db = Database::open_in_memory().unwrap();
        db.set("fittrack.calorie_note.2024-06-01", "x").unwrap();
        db.set("fittrack.calorie_note.2024-06-02", "y").unwrap();
        db.set("fittrack_calorie_note", "z").unwrap();
        db.set("other", "w").unwrap();

        let keys = db.keys_with_prefix("fittrack.calorie_note.").unwrap();
        assert_eq!(
            keys,
            vec![
                "fittrack.calorie_note.2024-06-01".to_string(),
                "fittrack.calorie_note.2024-06-02".to_string()
            ]
        );
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fittrack.db");
        {
            let db = Database::open(&path).unwrap();
            db.set("fittrack.nutrition_profile", "{\"age\":30}").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(
            db.get("fittrack.nutrition_profile").unwrap().as_deref(),
            Some("{\"age\":30}")
        );
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let version: i64 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
