//! Pending-request ledger: not-yet-committed update requests and the
//! outstanding per-field challenges gating their commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Unambiguous 18-character alphabet for human-typeable challenge ids,
/// matching the original deployment's `short_id` charset exactly.
const SHORT_ID_ALPHABET: &[u8] = b"CDEHKMPRSTUWXY2458";
const SHORT_ID_LEN: usize = 10;
const MAX_ALLOC_ATTEMPTS: u32 = 50;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("could not allocate a unique short id after {0} attempts")]
    IdExhausted(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Confirmed,
    Denied,
    Expired,
}

impl VerificationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationOutcome::Confirmed => "confirmed",
            VerificationOutcome::Denied => "denied",
            VerificationOutcome::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingUpdateRequest {
    pub id: String,
    pub request_json: String,
    pub public_key: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub short_id: String,
    pub parent_id: String,
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct DoneVerification {
    pub short_id: String,
    pub state: String,
    pub created_at: i64,
}

fn draw_short_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SHORT_ID_LEN)
        .map(|_| SHORT_ID_ALPHABET[rng.gen_range(0..SHORT_ID_ALPHABET.len())] as char)
        .collect()
}

#[async_trait]
pub trait PendingLedger: Send + Sync {
    async fn put_pending(
        &self,
        request_json: &str,
        public_key: &str,
        now: i64,
    ) -> Result<PendingUpdateRequest, LedgerError>;

    async fn allocate_challenge(
        &self,
        parent_id: &str,
        field: &str,
        value: &str,
    ) -> Result<PendingVerification, LedgerError>;

    async fn get_pending(&self, id: &str) -> Result<Option<PendingUpdateRequest>, LedgerError>;

    async fn newest_pending_for_key(
        &self,
        public_key: &str,
    ) -> Result<Option<PendingUpdateRequest>, LedgerError>;

    async fn get_pending_verification(
        &self,
        short_id: &str,
    ) -> Result<Option<PendingVerification>, LedgerError>;

    async fn get_done_verification(
        &self,
        short_id: &str,
    ) -> Result<Option<DoneVerification>, LedgerError>;

    async fn siblings_remaining(&self, parent_id: &str) -> Result<u64, LedgerError>;

    /// Deletes `short_id`'s pending row and idempotently records its outcome
    /// in the done table. Returns the parent id the challenge belonged to.
    async fn resolve(
        &self,
        short_id: &str,
        outcome: VerificationOutcome,
        now: i64,
    ) -> Result<Option<String>, LedgerError>;

    async fn purge(&self, parent_id: &str) -> Result<(), LedgerError>;

    async fn is_expired(&self, pending: &PendingUpdateRequest, now: i64, max_age_secs: i64) -> bool {
        now - pending.created_at >= max_age_secs
    }

    /// Best-effort background reclamation of requests nobody ever revisits.
    /// Purely a storage cleanup: the lazy `is_expired` check at resolve time
    /// remains the authoritative expiry enforcement.
    async fn sweep_expired(&self, now: i64, max_age_secs: i64) -> Result<u64, LedgerError>;
}

pub struct SqlitePendingLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePendingLedger {
    pub async fn new(path: &std::path::Path) -> Result<Self, LedgerError> {
        let path = path.to_owned();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
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
        "CREATE TABLE IF NOT EXISTS pending_requests (
            id TEXT PRIMARY KEY,
            request_json TEXT NOT NULL,
            public_key TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pending_requests_pubkey ON pending_requests(public_key);
        CREATE TABLE IF NOT EXISTS pending_verifications (
            short_id TEXT PRIMARY KEY,
            parent_id TEXT NOT NULL,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            FOREIGN KEY (parent_id) REFERENCES pending_requests(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_pending_verifications_parent ON pending_verifications(parent_id);
        CREATE TABLE IF NOT EXISTS done_verifications (
            short_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );",
    )
}

#[async_trait]
impl PendingLedger for SqlitePendingLedger {
    async fn put_pending(
        &self,
        request_json: &str,
        public_key: &str,
        now: i64,
    ) -> Result<PendingUpdateRequest, LedgerError> {
        let conn = self.conn.clone();
        let request_json = request_json.to_string();
        let public_key = public_key.to_string();
        tokio::task::spawn_blocking(move || -> Result<PendingUpdateRequest, LedgerError> {
            let conn = conn.lock().unwrap();
            let id = draw_short_id();
            conn.execute(
                "INSERT INTO pending_requests (id, request_json, public_key, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, request_json, public_key, now],
            )?;
            Ok(PendingUpdateRequest {
                id,
                request_json,
                public_key,
                created_at: now,
            })
        })
        .await?
    }

    async fn allocate_challenge(
        &self,
        parent_id: &str,
        field: &str,
        value: &str,
    ) -> Result<PendingVerification, LedgerError> {
        let conn = self.conn.clone();
        let parent_id = parent_id.to_string();
        let field = field.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || -> Result<PendingVerification, LedgerError> {
            let conn = conn.lock().unwrap();
            for _ in 0..MAX_ALLOC_ATTEMPTS {
                let short_id = draw_short_id();
                let exists_pending: bool = conn
                    .query_row(
                        "SELECT 1 FROM pending_verifications WHERE short_id = ?1",
                        params![short_id],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);
                let exists_done: bool = conn
                    .query_row(
                        "SELECT 1 FROM done_verifications WHERE short_id = ?1",
                        params![short_id],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);
                if exists_pending || exists_done {
                    continue;
                }
                conn.execute(
                    "INSERT INTO pending_verifications (short_id, parent_id, field, value) VALUES (?1, ?2, ?3, ?4)",
                    params![short_id, parent_id, field, value],
                )?;
                return Ok(PendingVerification {
                    short_id,
                    parent_id,
                    field,
                    value,
                });
            }
            Err(LedgerError::IdExhausted(MAX_ALLOC_ATTEMPTS))
        })
        .await?
    }

    async fn get_pending(&self, id: &str) -> Result<Option<PendingUpdateRequest>, LedgerError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<PendingUpdateRequest>, LedgerError> {
            let conn = conn.lock().unwrap();
            let row = conn
                .query_row(
                    "SELECT id, request_json, public_key, created_at FROM pending_requests WHERE id = ?1",
                    params![id],
                    |r| {
                        Ok(PendingUpdateRequest {
                            id: r.get(0)?,
                            request_json: r.get(1)?,
                            public_key: r.get(2)?,
                            created_at: r.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    async fn newest_pending_for_key(
        &self,
        public_key: &str,
    ) -> Result<Option<PendingUpdateRequest>, LedgerError> {
        let conn = self.conn.clone();
        let public_key = public_key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<PendingUpdateRequest>, LedgerError> {
            let conn = conn.lock().unwrap();
            let row = conn
                .query_row(
                    "SELECT id, request_json, public_key, created_at FROM pending_requests
                     WHERE public_key = ?1 ORDER BY created_at DESC LIMIT 1",
                    params![public_key],
                    |r| {
                        Ok(PendingUpdateRequest {
                            id: r.get(0)?,
                            request_json: r.get(1)?,
                            public_key: r.get(2)?,
                            created_at: r.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    async fn get_pending_verification(
        &self,
        short_id: &str,
    ) -> Result<Option<PendingVerification>, LedgerError> {
        let conn = self.conn.clone();
        let short_id = short_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<PendingVerification>, LedgerError> {
            let conn = conn.lock().unwrap();
            let row = conn
                .query_row(
                    "SELECT short_id, parent_id, field, value FROM pending_verifications WHERE short_id = ?1",
                    params![short_id],
                    |r| {
                        Ok(PendingVerification {
                            short_id: r.get(0)?,
                            parent_id: r.get(1)?,
                            field: r.get(2)?,
                            value: r.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    async fn get_done_verification(
        &self,
        short_id: &str,
    ) -> Result<Option<DoneVerification>, LedgerError> {
        let conn = self.conn.clone();
        let short_id = short_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<DoneVerification>, LedgerError> {
            let conn = conn.lock().unwrap();
            let row = conn
                .query_row(
                    "SELECT short_id, state, created_at FROM done_verifications WHERE short_id = ?1",
                    params![short_id],
                    |r| {
                        Ok(DoneVerification {
                            short_id: r.get(0)?,
                            state: r.get(1)?,
                            created_at: r.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    async fn siblings_remaining(&self, parent_id: &str) -> Result<u64, LedgerError> {
        let conn = self.conn.clone();
        let parent_id = parent_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<u64, LedgerError> {
            let conn = conn.lock().unwrap();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pending_verifications WHERE parent_id = ?1",
                params![parent_id],
                |r| r.get(0),
            )?;
            Ok(count as u64)
        })
        .await?
    }

    async fn resolve(
        &self,
        short_id: &str,
        outcome: VerificationOutcome,
        now: i64,
    ) -> Result<Option<String>, LedgerError> {
        let conn = self.conn.clone();
        let short_id = short_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<String>, LedgerError> {
            let conn = conn.lock().unwrap();
            let parent_id: Option<String> = conn
                .query_row(
                    "SELECT parent_id FROM pending_verifications WHERE short_id = ?1",
                    params![short_id],
                    |r| r.get(0),
                )
                .optional()?;

            conn.execute(
                "DELETE FROM pending_verifications WHERE short_id = ?1",
                params![short_id],
            )?;

            let existing_state: Option<String> = conn
                .query_row(
                    "SELECT state FROM done_verifications WHERE short_id = ?1",
                    params![short_id],
                    |r| r.get(0),
                )
                .optional()?;

            match existing_state {
                None => {
                    conn.execute(
                        "INSERT INTO done_verifications (short_id, state, created_at) VALUES (?1, ?2, ?3)",
                        params![short_id, outcome.as_str(), now],
                    )?;
                }
                Some(_) if outcome != VerificationOutcome::Expired => {
                    conn.execute(
                        "UPDATE done_verifications SET state = ?2 WHERE short_id = ?1",
                        params![short_id, outcome.as_str()],
                    )?;
                }
                Some(_) => {}
            }

            Ok(parent_id)
        })
        .await?
    }

    async fn purge(&self, parent_id: &str) -> Result<(), LedgerError> {
        let conn = self.conn.clone();
        let parent_id = parent_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), LedgerError> {
            let conn = conn.lock().unwrap();
            conn.execute(
                "DELETE FROM pending_verifications WHERE parent_id = ?1",
                params![parent_id],
            )?;
            conn.execute(
                "DELETE FROM pending_requests WHERE id = ?1",
                params![parent_id],
            )?;
            Ok(())
        })
        .await?
    }

    async fn sweep_expired(&self, now: i64, max_age_secs: i64) -> Result<u64, LedgerError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, LedgerError> {
            let conn = conn.lock().unwrap();
            let cutoff = now - max_age_secs;
            let mut stmt = conn.prepare("SELECT id FROM pending_requests WHERE created_at <= ?1")?;
            let ids: Vec<String> = stmt
                .query_map(params![cutoff], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            for id in &ids {
                conn.execute(
                    "DELETE FROM pending_verifications WHERE parent_id = ?1",
                    params![id],
                )?;
                conn.execute("DELETE FROM pending_requests WHERE id = ?1", params![id])?;
            }
            Ok(ids.len() as u64)
        })
        .await?
    }
}

/// In-memory implementation for unit tests.
#[derive(Default)]
pub struct MemoryPendingLedger {
    inner: Mutex<MemoryLedgerInner>,
}

#[derive(Default)]
struct MemoryLedgerInner {
    pending_requests: HashMap<String, PendingUpdateRequest>,
    pending_verifications: HashMap<String, PendingVerification>,
    done_verifications: HashMap<String, DoneVerification>,
}

impl MemoryPendingLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingLedger for MemoryPendingLedger {
    async fn put_pending(
        &self,
        request_json: &str,
        public_key: &str,
        now: i64,
    ) -> Result<PendingUpdateRequest, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let id = loop {
            let candidate = draw_short_id();
            if !inner.pending_requests.contains_key(&candidate) {
                break candidate;
            }
        };
        let pending = PendingUpdateRequest {
            id: id.clone(),
            request_json: request_json.to_string(),
            public_key: public_key.to_string(),
            created_at: now,
        };
        inner.pending_requests.insert(id, pending.clone());
        Ok(pending)
    }

    async fn allocate_challenge(
        &self,
        parent_id: &str,
        field: &str,
        value: &str,
    ) -> Result<PendingVerification, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..MAX_ALLOC_ATTEMPTS {
            let short_id = draw_short_id();
            if inner.pending_verifications.contains_key(&short_id)
                || inner.done_verifications.contains_key(&short_id)
            {
                continue;
            }
            let v = PendingVerification {
                short_id: short_id.clone(),
                parent_id: parent_id.to_string(),
                field: field.to_string(),
                value: value.to_string(),
            };
            inner.pending_verifications.insert(short_id, v.clone());
            return Ok(v);
        }
        Err(LedgerError::IdExhausted(MAX_ALLOC_ATTEMPTS))
    }

    async fn get_pending(&self, id: &str) -> Result<Option<PendingUpdateRequest>, LedgerError> {
        Ok(self.inner.lock().unwrap().pending_requests.get(id).cloned())
    }

    async fn newest_pending_for_key(
        &self,
        public_key: &str,
    ) -> Result<Option<PendingUpdateRequest>, LedgerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .pending_requests
            .values()
            .filter(|p| p.public_key == public_key)
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn get_pending_verification(
        &self,
        short_id: &str,
    ) -> Result<Option<PendingVerification>, LedgerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .pending_verifications
            .get(short_id)
            .cloned())
    }

    async fn get_done_verification(
        &self,
        short_id: &str,
    ) -> Result<Option<DoneVerification>, LedgerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .done_verifications
            .get(short_id)
            .cloned())
    }

    async fn siblings_remaining(&self, parent_id: &str) -> Result<u64, LedgerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .pending_verifications
            .values()
            .filter(|v| v.parent_id == parent_id)
            .count() as u64)
    }

    async fn resolve(
        &self,
        short_id: &str,
        outcome: VerificationOutcome,
        now: i64,
    ) -> Result<Option<String>, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.pending_verifications.remove(short_id);
        let parent_id = removed.map(|v| v.parent_id);

        match inner.done_verifications.get(short_id) {
            None => {
                inner.done_verifications.insert(
                    short_id.to_string(),
                    DoneVerification {
                        short_id: short_id.to_string(),
                        state: outcome.as_str().to_string(),
                        created_at: now,
                    },
                );
            }
            Some(_) if outcome != VerificationOutcome::Expired => {
                inner.done_verifications.get_mut(short_id).unwrap().state =
                    outcome.as_str().to_string();
            }
            Some(_) => {}
        }

        Ok(parent_id)
    }

    async fn purge(&self, parent_id: &str) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_requests.remove(parent_id);
        inner
            .pending_verifications
            .retain(|_, v| v.parent_id != parent_id);
        Ok(())
    }

    async fn sweep_expired(&self, now: i64, max_age_secs: i64) -> Result<u64, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = now - max_age_secs;
        let expired: Vec<String> = inner
            .pending_requests
            .values()
            .filter(|p| p.created_at <= cutoff)
            .map(|p| p.id.clone())
            .collect();
        for id in &expired {
            inner.pending_requests.remove(id);
            inner.pending_verifications.retain(|_, v| &v.parent_id != id);
        }
        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn sqlite_ledger_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("ledger.db");
        let ledger = SqlitePendingLedger::new(&db_path).await.unwrap();

        let pending = ledger.put_pending("{}", "abc", 0).await.unwrap();
        let challenge = ledger
            .allocate_challenge(&pending.id, "email", "x@example.com")
            .await
            .unwrap();

        assert_eq!(ledger.siblings_remaining(&pending.id).await.unwrap(), 1);

        let parent = ledger
            .resolve(&challenge.short_id, VerificationOutcome::Confirmed, 10)
            .await
            .unwrap();
        assert_eq!(parent.as_deref(), Some(pending.id.as_str()));
        assert!(ledger.get_pending_verification(&challenge.short_id).await.unwrap().is_none());

        let done = ledger.get_done_verification(&challenge.short_id).await.unwrap().unwrap();
        assert_eq!(done.state, "confirmed");
    }

    #[tokio::test]
    async fn sqlite_ledger_purge_deletes_parent_and_siblings() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("ledger.db");
        let ledger = SqlitePendingLedger::new(&db_path).await.unwrap();

        let pending = ledger.put_pending("{}", "abc", 0).await.unwrap();
        ledger.allocate_challenge(&pending.id, "email", "a").await.unwrap();
        ledger.allocate_challenge(&pending.id, "phone", "b").await.unwrap();

        ledger.purge(&pending.id).await.unwrap();

        assert!(ledger.get_pending(&pending.id).await.unwrap().is_none());
        assert_eq!(ledger.siblings_remaining(&pending.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sqlite_ledger_sweep_expired_reclaims_only_old_requests() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("ledger.db");
        let ledger = SqlitePendingLedger::new(&db_path).await.unwrap();

        let old = ledger.put_pending("{}", "abc", 0).await.unwrap();
        let fresh = ledger.put_pending("{}", "def", 1000).await.unwrap();

        let reclaimed = ledger.sweep_expired(1000, 100).await.unwrap();

        assert_eq!(reclaimed, 1);
        assert!(ledger.get_pending(&old.id).await.unwrap().is_none());
        assert!(ledger.get_pending(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resolve_is_idempotent_after_pending_row_is_gone() {
        let ledger = MemoryPendingLedger::new();
        let pending = ledger.put_pending("{}", "abc", 0).await.unwrap();
        let challenge = ledger
            .allocate_challenge(&pending.id, "email", "x@example.com")
            .await
            .unwrap();

        let parent = ledger
            .resolve(&challenge.short_id, VerificationOutcome::Confirmed, 100)
            .await
            .unwrap();
        assert_eq!(parent.as_deref(), Some(pending.id.as_str()));

        // Repeating confirm after the pending row is gone is a no-op status-wise.
        let parent_again = ledger
            .resolve(&challenge.short_id, VerificationOutcome::Confirmed, 200)
            .await
            .unwrap();
        assert!(parent_again.is_none());

        let done = ledger.get_done_verification(&challenge.short_id).await.unwrap().unwrap();
        assert_eq!(done.state, "confirmed");
    }

    #[tokio::test]
    async fn expired_outcome_never_overwrites_existing_state() {
        let ledger = MemoryPendingLedger::new();
        let pending = ledger.put_pending("{}", "abc", 0).await.unwrap();
        let challenge = ledger
            .allocate_challenge(&pending.id, "email", "x@example.com")
            .await
            .unwrap();

        ledger
            .resolve(&challenge.short_id, VerificationOutcome::Denied, 0)
            .await
            .unwrap();
        ledger
            .resolve(&challenge.short_id, VerificationOutcome::Expired, 1)
            .await
            .unwrap();

        let done = ledger.get_done_verification(&challenge.short_id).await.unwrap().unwrap();
        assert_eq!(done.state, "denied");
    }

    #[tokio::test]
    async fn siblings_remaining_counts_down() {
        let ledger = MemoryPendingLedger::new();
        let pending = ledger.put_pending("{}", "abc", 0).await.unwrap();
        let c1 = ledger.allocate_challenge(&pending.id, "email", "a").await.unwrap();
        let _c2 = ledger.allocate_challenge(&pending.id, "phone", "b").await.unwrap();

        assert_eq!(ledger.siblings_remaining(&pending.id).await.unwrap(), 2);
        ledger.resolve(&c1.short_id, VerificationOutcome::Confirmed, 0).await.unwrap();
        assert_eq!(ledger.siblings_remaining(&pending.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sweep_expired_reclaims_only_old_requests() {
        let ledger = MemoryPendingLedger::new();
        let old = ledger.put_pending("{}", "abc", 0).await.unwrap();
        let fresh = ledger.put_pending("{}", "def", 1000).await.unwrap();

        let max_age = 100;
        let reclaimed = ledger.sweep_expired(1000, max_age).await.unwrap();

        assert_eq!(reclaimed, 1);
        assert!(ledger.get_pending(&old.id).await.unwrap().is_none());
        assert!(ledger.get_pending(&fresh.id).await.unwrap().is_some());
    }
}
