//! Directory store: identities and the private entries attached to them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Email,
    Phone,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Field::Email => "email",
            Field::Phone => "phone",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Field::Email),
            "phone" => Some(Field::Phone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub public_key: String,
    pub alias: String,
    pub drop_url: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub public_key: String,
    pub field: Field,
    pub value: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub field: Field,
    pub value: String,
}

/// Storage abstraction for identities and their entries: async trait,
/// with blocking work wrapped in `spawn_blocking` by the concrete
/// implementation.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn find_or_create_identity(
        &self,
        public_key: &str,
        alias: &str,
        drop_url: &str,
        now: i64,
    ) -> Result<Identity, StoreError>;

    async fn get_identity(&self, public_key: &str) -> Result<Option<Identity>, StoreError>;

    async fn upsert_entry(
        &self,
        public_key: &str,
        field: Field,
        value: &str,
        now: i64,
    ) -> Result<(), StoreError>;

    async fn delete_entry(&self, public_key: &str, field: Field) -> Result<(), StoreError>;

    async fn get_entries(&self, public_key: &str) -> Result<Vec<Entry>, StoreError>;

    async fn entry_count(&self, public_key: &str) -> Result<u64, StoreError>;

    async fn delete_identity_if_garbage(&self, public_key: &str) -> Result<(), StoreError>;

    async fn delete_identity(&self, public_key: &str) -> Result<(), StoreError>;

    /// Applies a full update atomically: upserts the identity, applies every
    /// `(field, value, is_delete)` item in order, then collapses the
    /// identity if it ended up with zero entries.
    async fn commit_update(
        &self,
        public_key: &str,
        alias: &str,
        drop_url: &str,
        items: &[(Field, String, bool)],
        now: i64,
    ) -> Result<(), StoreError>;

    /// `queries` maps field to the set of values being searched for.
    async fn search(
        &self,
        queries: &HashMap<Field, Vec<String>>,
    ) -> Result<Vec<(Identity, Vec<Match>)>, StoreError>;
}

pub struct SqliteDirectoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDirectoryStore {
    pub async fn new(path: &std::path::Path) -> Result<Self, StoreError> {
        let path = path.to_owned();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open(path)?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS identities (
            public_key TEXT PRIMARY KEY,
            alias TEXT NOT NULL,
            drop_url TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS entries (
            public_key TEXT NOT NULL,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (public_key, field),
            FOREIGN KEY (public_key) REFERENCES identities(public_key) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_entries_field_value ON entries(field, value);",
    )
}

#[async_trait]
impl DirectoryStore for SqliteDirectoryStore {
    async fn find_or_create_identity(
        &self,
        public_key: &str,
        alias: &str,
        drop_url: &str,
        now: i64,
    ) -> Result<Identity, StoreError> {
        let conn = self.conn.clone();
        let public_key = public_key.to_string();
        let alias = alias.to_string();
        let drop_url = drop_url.to_string();
        tokio::task::spawn_blocking(move || -> Result<Identity, StoreError> {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO identities (public_key, alias, drop_url, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(public_key) DO UPDATE SET alias = excluded.alias, drop_url = excluded.drop_url",
                params![public_key, alias, drop_url, now],
            )?;
            let row = conn.query_row(
                "SELECT public_key, alias, drop_url, created_at FROM identities WHERE public_key = ?1",
                params![public_key],
                |r| {
                    Ok(Identity {
                        public_key: r.get(0)?,
                        alias: r.get(1)?,
                        drop_url: r.get(2)?,
                        created_at: r.get(3)?,
                    })
                },
            )?;
            Ok(row)
        })
        .await?
    }

    async fn get_identity(&self, public_key: &str) -> Result<Option<Identity>, StoreError> {
        let conn = self.conn.clone();
        let public_key = public_key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Identity>, StoreError> {
            let conn = conn.lock().unwrap();
            let row = conn
                .query_row(
                    "SELECT public_key, alias, drop_url, created_at FROM identities WHERE public_key = ?1",
                    params![public_key],
                    |r| {
                        Ok(Identity {
                            public_key: r.get(0)?,
                            alias: r.get(1)?,
                            drop_url: r.get(2)?,
                            created_at: r.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    async fn upsert_entry(
        &self,
        public_key: &str,
        field: Field,
        value: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let public_key = public_key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO entries (public_key, field, value, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(public_key, field) DO UPDATE SET value = excluded.value",
                params![public_key, field.as_str(), value, now],
            )?;
            Ok(())
        })
        .await?
    }

    async fn delete_entry(&self, public_key: &str, field: Field) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let public_key = public_key.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.lock().unwrap();
            conn.execute(
                "DELETE FROM entries WHERE public_key = ?1 AND field = ?2",
                params![public_key, field.as_str()],
            )?;
            Ok(())
        })
        .await?
    }

    async fn get_entries(&self, public_key: &str) -> Result<Vec<Entry>, StoreError> {
        let conn = self.conn.clone();
        let public_key = public_key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<Entry>, StoreError> {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT public_key, field, value, created_at FROM entries WHERE public_key = ?1",
            )?;
            let rows = stmt
                .query_map(params![public_key], |r| {
                    let field_str: String = r.get(1)?;
                    Ok(Entry {
                        public_key: r.get(0)?,
                        field: Field::parse(&field_str).unwrap_or(Field::Email),
                        value: r.get(2)?,
                        created_at: r.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    async fn entry_count(&self, public_key: &str) -> Result<u64, StoreError> {
        let conn = self.conn.clone();
        let public_key = public_key.to_string();
        tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let conn = conn.lock().unwrap();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE public_key = ?1",
                params![public_key],
                |r| r.get(0),
            )?;
            Ok(count as u64)
        })
        .await?
    }

    async fn delete_identity_if_garbage(&self, public_key: &str) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let public_key = public_key.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.lock().unwrap();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE public_key = ?1",
                params![public_key],
                |r| r.get(0),
            )?;
            if count == 0 {
                conn.execute(
                    "DELETE FROM identities WHERE public_key = ?1",
                    params![public_key],
                )?;
            }
            Ok(())
        })
        .await?
    }

    async fn delete_identity(&self, public_key: &str) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let public_key = public_key.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.lock().unwrap();
            conn.execute(
                "DELETE FROM entries WHERE public_key = ?1",
                params![public_key],
            )?;
            conn.execute(
                "DELETE FROM identities WHERE public_key = ?1",
                params![public_key],
            )?;
            Ok(())
        })
        .await?
    }

    async fn commit_update(
        &self,
        public_key: &str,
        alias: &str,
        drop_url: &str,
        items: &[(Field, String, bool)],
        now: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let public_key = public_key.to_string();
        let alias = alias.to_string();
        let drop_url = drop_url.to_string();
        let items = items.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO identities (public_key, alias, drop_url, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(public_key) DO UPDATE SET alias = excluded.alias, drop_url = excluded.drop_url",
                params![public_key, alias, drop_url, now],
            )?;

            let mut any_delete = false;
            for (field, value, is_delete) in &items {
                if *is_delete {
                    any_delete = true;
                    tx.execute(
                        "DELETE FROM entries WHERE public_key = ?1 AND field = ?2",
                        params![public_key, field.as_str()],
                    )?;
                } else {
                    tx.execute(
                        "INSERT INTO entries (public_key, field, value, created_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(public_key, field) DO UPDATE SET value = excluded.value",
                        params![public_key, field.as_str(), value, now],
                    )?;
                }
            }

            if any_delete {
                let count: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM entries WHERE public_key = ?1",
                    params![public_key],
                    |r| r.get(0),
                )?;
                if count == 0 {
                    tx.execute(
                        "DELETE FROM identities WHERE public_key = ?1",
                        params![public_key],
                    )?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn search(
        &self,
        queries: &HashMap<Field, Vec<String>>,
    ) -> Result<Vec<(Identity, Vec<Match>)>, StoreError> {
        let conn = self.conn.clone();
        let queries: Vec<(Field, String)> = queries
            .iter()
            .flat_map(|(f, vs)| vs.iter().map(move |v| (*f, v.clone())))
            .collect();

        tokio::task::spawn_blocking(move || -> Result<Vec<(Identity, Vec<Match>)>, StoreError> {
            let conn = conn.lock().unwrap();
            let mut matched: HashMap<String, (Identity, Vec<Match>)> = HashMap::new();

            for (field, value) in &queries {
                let mut stmt = conn.prepare(
                    "SELECT i.public_key, i.alias, i.drop_url, i.created_at
                     FROM identities i
                     JOIN entries e ON e.public_key = i.public_key
                     WHERE e.field = ?1 AND e.value = ?2",
                )?;
                let rows = stmt
                    .query_map(params![field.as_str(), value], |r| {
                        Ok(Identity {
                            public_key: r.get(0)?,
                            alias: r.get(1)?,
                            drop_url: r.get(2)?,
                            created_at: r.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                for identity in rows {
                    let entry = matched
                        .entry(identity.public_key.clone())
                        .or_insert_with(|| (identity, Vec::new()));
                    entry.1.push(Match {
                        field: *field,
                        value: value.clone(),
                    });
                }
            }

            let mut results: Vec<(Identity, Vec<Match>)> = matched.into_values().collect();
            for (_, matches) in results.iter_mut() {
                matches.sort_by(|a, b| (a.field.as_str(), &a.value).cmp(&(b.field.as_str(), &b.value)));
                matches.dedup();
            }
            results.sort_by(|a, b| a.0.public_key.cmp(&b.0.public_key));
            Ok(results)
        })
        .await?
    }
}

/// In-memory implementation for unit tests.
#[derive(Default)]
pub struct MemoryDirectoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    identities: HashMap<String, Identity>,
    entries: HashMap<(String, Field), Entry>,
}

impl MemoryDirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectoryStore {
    async fn find_or_create_identity(
        &self,
        public_key: &str,
        alias: &str,
        drop_url: &str,
        now: i64,
    ) -> Result<Identity, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let identity = inner
            .identities
            .entry(public_key.to_string())
            .and_modify(|i| {
                i.alias = alias.to_string();
                i.drop_url = drop_url.to_string();
            })
            .or_insert_with(|| Identity {
                public_key: public_key.to_string(),
                alias: alias.to_string(),
                drop_url: drop_url.to_string(),
                created_at: now,
            });
        Ok(identity.clone())
    }

    async fn get_identity(&self, public_key: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self.inner.lock().unwrap().identities.get(public_key).cloned())
    }

    async fn upsert_entry(
        &self,
        public_key: &str,
        field: Field,
        value: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(
            (public_key.to_string(), field),
            Entry {
                public_key: public_key.to_string(),
                field,
                value: value.to_string(),
                created_at: now,
            },
        );
        Ok(())
    }

    async fn delete_entry(&self, public_key: &str, field: Field) -> Result<(), StoreError> {
        self.inner.lock().unwrap().entries.remove(&(public_key.to_string(), field));
        Ok(())
    }

    async fn get_entries(&self, public_key: &str) -> Result<Vec<Entry>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|e| e.public_key == public_key)
            .cloned()
            .collect())
    }

    async fn entry_count(&self, public_key: &str) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .entries
            .keys()
            .filter(|(pk, _)| pk == public_key)
            .count() as u64)
    }

    async fn delete_identity_if_garbage(&self, public_key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let has_entries = inner.entries.keys().any(|(pk, _)| pk == public_key);
        if !has_entries {
            inner.identities.remove(public_key);
        }
        Ok(())
    }

    async fn delete_identity(&self, public_key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.identities.remove(public_key);
        inner.entries.retain(|(pk, _), _| pk != public_key);
        Ok(())
    }

    async fn search(
        &self,
        queries: &HashMap<Field, Vec<String>>,
    ) -> Result<Vec<(Identity, Vec<Match>)>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut matched: HashMap<String, (Identity, Vec<Match>)> = HashMap::new();

        for (field, values) in queries {
            for value in values {
                for entry in inner.entries.values() {
                    if entry.field == *field && &entry.value == value {
                        if let Some(identity) = inner.identities.get(&entry.public_key) {
                            let slot = matched
                                .entry(identity.public_key.clone())
                                .or_insert_with(|| (identity.clone(), Vec::new()));
                            slot.1.push(Match {
                                field: *field,
                                value: value.clone(),
                            });
                        }
                    }
                }
            }
        }

        let mut results: Vec<(Identity, Vec<Match>)> = matched.into_values().collect();
        for (_, matches) in results.iter_mut() {
            matches.sort_by(|a, b| (a.field.as_str(), &a.value).cmp(&(b.field.as_str(), &b.value)));
            matches.dedup();
        }
        results.sort_by(|a, b| a.0.public_key.cmp(&b.0.public_key));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn sqlite_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("directory.db");
        let store = SqliteDirectoryStore::new(&db_path).await.unwrap();

        store
            .find_or_create_identity("abc", "alias", "http://example.com/x", 0)
            .await
            .unwrap();
        store.upsert_entry("abc", Field::Email, "x@example.com", 0).await.unwrap();

        let identity = store.get_identity("abc").await.unwrap().unwrap();
        assert_eq!(identity.alias, "alias");

        let entries = store.get_entries("abc").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "x@example.com");
    }

    #[tokio::test]
    async fn sqlite_store_last_writer_wins_on_reregistration() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("directory.db");
        let store = SqliteDirectoryStore::new(&db_path).await.unwrap();

        store
            .find_or_create_identity("abc", "old alias", "http://example.com/old", 0)
            .await
            .unwrap();
        let updated = store
            .find_or_create_identity("abc", "new alias", "http://example.com/new", 10)
            .await
            .unwrap();

        assert_eq!(updated.alias, "new alias");
        assert_eq!(updated.drop_url, "http://example.com/new");
        assert_eq!(updated.created_at, 0, "created_at is not touched by a re-registration");
    }

    #[tokio::test]
    async fn sqlite_commit_update_collapses_empty_identity() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("directory.db");
        let store = SqliteDirectoryStore::new(&db_path).await.unwrap();

        store
            .commit_update(
                "abc",
                "alias",
                "http://example.com/x",
                &[(Field::Email, "x@example.com".to_string(), false)],
                0,
            )
            .await
            .unwrap();
        assert!(store.get_identity("abc").await.unwrap().is_some());

        store
            .commit_update(
                "abc",
                "alias",
                "http://example.com/x",
                &[(Field::Email, String::new(), true)],
                1,
            )
            .await
            .unwrap();
        assert!(store.get_identity("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_search_matches_across_identities_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("directory.db");
        let store = SqliteDirectoryStore::new(&db_path).await.unwrap();

        store.find_or_create_identity("abc", "a", "http://example.com/a", 0).await.unwrap();
        store.upsert_entry("abc", Field::Email, "x@example.com", 0).await.unwrap();
        store.find_or_create_identity("def", "b", "http://example.com/b", 0).await.unwrap();
        store.upsert_entry("def", Field::Phone, "+491234", 0).await.unwrap();

        let mut q = HashMap::new();
        q.insert(Field::Email, vec!["x@example.com".to_string()]);
        q.insert(Field::Phone, vec!["+491234".to_string()]);
        let results = store.search(&q).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.public_key, "abc");
        assert_eq!(results[1].0.public_key, "def");
    }

    #[tokio::test]
    async fn create_then_search_finds_entry() {
        let store = MemoryDirectoryStore::new();
        store
            .find_or_create_identity("abc", "alias", "http://example.com/x", 0)
            .await
            .unwrap();
        store
            .upsert_entry("abc", Field::Email, "x@example.com", 0)
            .await
            .unwrap();

        let mut q = HashMap::new();
        q.insert(Field::Email, vec!["x@example.com".to_string()]);
        let results = store.search(&q).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.public_key, "abc");
        assert_eq!(results[0].1.len(), 1);
    }

    #[tokio::test]
    async fn delete_if_garbage_removes_empty_identity() {
        let store = MemoryDirectoryStore::new();
        store
            .find_or_create_identity("abc", "alias", "http://example.com/x", 0)
            .await
            .unwrap();
        store
            .upsert_entry("abc", Field::Email, "x@example.com", 0)
            .await
            .unwrap();
        store.delete_entry("abc", Field::Email).await.unwrap();
        store.delete_identity_if_garbage("abc").await.unwrap();

        assert!(store.get_identity("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_entry_replaces_value_for_same_field() {
        let store = MemoryDirectoryStore::new();
        store
            .find_or_create_identity("abc", "alias", "http://example.com/x", 0)
            .await
            .unwrap();
        store.upsert_entry("abc", Field::Phone, "+491", 0).await.unwrap();
        store.upsert_entry("abc", Field::Phone, "+492", 0).await.unwrap();

        let entries = store.get_entries("abc").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "+492");
    }
}
