//! Rule Repository (C9): the persistence port the engine's rule compiler and
//! the admin surface both sit on top of. Treated by the core engine as an
//! opaque collaborator (per the specification's scope note); this crate
//! supplies a SQLite-backed implementation and an in-memory one for tests and
//! dev mode.
//!
//! Grounded on `bridge.rs`'s `Bridge`: SQLite schema created at init, the
//! connection held behind a `parking_lot::Mutex` (rusqlite's `Connection` is
//! `Send` but not `Sync`), and a row-at-a-time upsert/export path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use deepmock_engine::wire::{Rule, Weight};
use deepmock_engine::stable_hash;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error("optimistic concurrency conflict on rule {id}: expected version {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: i64,
        actual: i64,
    },
    #[error("rule failed structural validation: {0}")]
    InvalidRule(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// `{ id, path, method, variable (JSON bytes), weight (JSON bytes), responses
/// (JSON bytes), version, ctime, mtime, disabled }` — the persisted row shape.
/// `disabled = true` rows never surface from `export`.
#[derive(Debug, Clone)]
pub struct StoredRule {
    pub rule: Rule,
    pub ctime: i64,
    pub mtime: i64,
    pub disabled: bool,
}

/// The abstract persistence port consumed by the reconciler and the admin
/// layer: `CreateRule / UpdateRule / GetRuleByID / DeleteRule / Export /
/// Import`.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn create_rule(&self, rule: Rule) -> Result<Rule, RepositoryError>;
    async fn update_rule(&self, rule: Rule) -> Result<Rule, RepositoryError>;
    async fn get_rule_by_id(&self, id: &str) -> Result<Option<Rule>, RepositoryError>;
    async fn delete_rule(&self, id: &str) -> Result<(), RepositoryError>;
    async fn export(&self) -> Result<Vec<Rule>, RepositoryError>;
    async fn import(&self, rules: Vec<Rule>) -> Result<(), RepositoryError>;
}

fn derive_and_stamp_id(mut rule: Rule) -> Result<Rule, RepositoryError> {
    if rule.path.is_empty() {
        return Err(RepositoryError::InvalidRule("path must not be empty".to_string()));
    }
    if rule.method.is_empty() {
        return Err(RepositoryError::InvalidRule("method must not be empty".to_string()));
    }
    rule.method = rule.method.to_uppercase();
    let derived = stable_hash(&rule.method, &rule.path);
    match &rule.id {
        Some(stored) if !stored.is_empty() && stored != &derived => {
            return Err(RepositoryError::InvalidRule(format!(
                "id {stored:?} does not match derived id {derived:?}"
            )))
        }
        _ => {}
    }
    rule.id = Some(derived);
    Ok(rule)
}

// ================================================================================================
// SQLITE IMPLEMENTATION
// ================================================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rule (
    id         TEXT PRIMARY KEY,
    path       TEXT NOT NULL,
    method     TEXT NOT NULL,
    variable   TEXT,
    weight     TEXT,
    responses  TEXT NOT NULL,
    version    INTEGER NOT NULL DEFAULT 1,
    ctime      INTEGER NOT NULL,
    mtime      INTEGER NOT NULL,
    disabled   INTEGER NOT NULL DEFAULT 0
);
";

pub struct SqliteRuleRepository {
    conn: Mutex<Connection>,
}

impl SqliteRuleRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let conn = Connection::open(path).map_err(|e| RepositoryError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        Self::open(":memory:")
    }

    fn row_to_rule(
        id: String,
        path: String,
        method: String,
        variable: Option<String>,
        weight: Option<String>,
        responses: String,
        version: i64,
    ) -> Result<Rule, RepositoryError> {
        let variable = variable
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        let weight: Option<Weight> = weight
            .map(|w| serde_json::from_str(&w))
            .transpose()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        let responses = serde_json::from_str(&responses)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        Ok(Rule {
            id: Some(id),
            path,
            method,
            variable,
            weight,
            responses,
            version,
        })
    }
}

#[async_trait]
impl RuleRepository for SqliteRuleRepository {
    async fn create_rule(&self, rule: Rule) -> Result<Rule, RepositoryError> {
        let rule = derive_and_stamp_id(rule)?;
        let id = rule.id.clone().expect("stamped above");
        let now = now_secs();
        let variable = rule
            .variable
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        let weight = rule
            .weight
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        let responses = serde_json::to_string(&rule.responses)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rule (id, path, method, variable, weight, responses, version, ctime, mtime, disabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7, 0)",
            params![id, rule.path, rule.method, variable, weight, responses, now],
        )
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        Ok(Rule {
            version: 1,
            ..rule
        })
    }

    async fn update_rule(&self, rule: Rule) -> Result<Rule, RepositoryError> {
        let rule = derive_and_stamp_id(rule)?;
        let id = rule.id.clone().expect("stamped above");
        let now = now_secs();

        let conn = self.conn.lock();
        let current_version: i64 = conn
            .query_row("SELECT version FROM rule WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;

        if current_version != rule.version {
            return Err(RepositoryError::VersionConflict {
                id,
                expected: rule.version,
                actual: current_version,
            });
        }

        let next_version = current_version + 1;
        let variable = rule
            .variable
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        let weight = rule
            .weight
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        let responses = serde_json::to_string(&rule.responses)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        conn.execute(
            "UPDATE rule SET path = ?1, method = ?2, variable = ?3, weight = ?4, responses = ?5,
             version = ?6, mtime = ?7 WHERE id = ?8",
            params![rule.path, rule.method, variable, weight, responses, next_version, now, id],
        )
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        Ok(Rule {
            version: next_version,
            ..rule
        })
    }

    async fn get_rule_by_id(&self, id: &str) -> Result<Option<Rule>, RepositoryError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, path, method, variable, weight, responses, version FROM rule
             WHERE id = ?1 AND disabled = 0",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()
        .map_err(|e| RepositoryError::Storage(e.to_string()))?
        .map(|(id, path, method, variable, weight, responses, version)| {
            Self::row_to_rule(id, path, method, variable, weight, responses, version)
        })
        .transpose()
    }

    async fn delete_rule(&self, id: &str) -> Result<(), RepositoryError> {
        let conn = self.conn.lock();
        let affected = conn
            .execute("UPDATE rule SET disabled = 1 WHERE id = ?1", params![id])
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        if affected == 0 {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn export(&self) -> Result<Vec<Rule>, RepositoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, path, method, variable, weight, responses, version FROM rule
                 WHERE disabled = 0",
            )
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })
            .map_err(|e| RepositoryError::Storage(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        rows.into_iter()
            .map(|(id, path, method, variable, weight, responses, version)| {
                Self::row_to_rule(id, path, method, variable, weight, responses, version)
            })
            .collect()
    }

    /// Wholesale replace: unlike [`RuleRepository::create_rule`], this
    /// preserves each incoming rule's `version` verbatim rather than
    /// resetting it to 1, so an export→import round trip doesn't silently
    /// reset the reconciler's change-detection state.
    async fn import(&self, rules: Vec<Rule>) -> Result<(), RepositoryError> {
        let now = now_secs();
        let conn = self.conn.lock();
        conn.execute("DELETE FROM rule", [])
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        for rule in rules {
            let rule = derive_and_stamp_id(rule)?;
            let id = rule.id.clone().expect("stamped above");
            let variable = rule
                .variable
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;
            let weight = rule
                .weight
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;
            let responses = serde_json::to_string(&rule.responses)
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            conn.execute(
                "INSERT INTO rule (id, path, method, variable, weight, responses, version, ctime, mtime, disabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 0)",
                params![id, rule.path, rule.method, variable, weight, responses, rule.version, now],
            )
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        }
        Ok(())
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ================================================================================================
// IN-MEMORY IMPLEMENTATION (tests / dev mode)
// ================================================================================================

/// A repository backed by a plain in-process map. Useful for unit tests and a
/// `--no-db` dev mode; not durable across restarts.
pub struct InMemoryRuleRepository {
    rows: Mutex<HashMap<String, StoredRule>>,
    clock: AtomicI64,
}

impl InMemoryRuleRepository {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            clock: AtomicI64::new(1),
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InMemoryRuleRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn create_rule(&self, rule: Rule) -> Result<Rule, RepositoryError> {
        let rule = derive_and_stamp_id(rule)?;
        let id = rule.id.clone().expect("stamped above");
        let now = self.tick();
        let mut rows = self.rows.lock();
        if rows.contains_key(&id) {
            return Err(RepositoryError::InvalidRule(format!(
                "rule {id} already exists"
            )));
        }
        let stored = Rule { version: 1, ..rule };
        rows.insert(
            id,
            StoredRule {
                rule: stored.clone(),
                ctime: now,
                mtime: now,
                disabled: false,
            },
        );
        Ok(stored)
    }

    async fn update_rule(&self, rule: Rule) -> Result<Rule, RepositoryError> {
        let rule = derive_and_stamp_id(rule)?;
        let id = rule.id.clone().expect("stamped above");
        let mut rows = self.rows.lock();
        let existing = rows
            .get(&id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        if existing.rule.version != rule.version {
            return Err(RepositoryError::VersionConflict {
                id,
                expected: rule.version,
                actual: existing.rule.version,
            });
        }
        let next_version = rule.version + 1;
        let stored = Rule {
            version: next_version,
            ..rule
        };
        let ctime = existing.ctime;
        let mtime = self.tick();
        rows.insert(
            id,
            StoredRule {
                rule: stored.clone(),
                ctime,
                mtime,
                disabled: false,
            },
        );
        Ok(stored)
    }

    async fn get_rule_by_id(&self, id: &str) -> Result<Option<Rule>, RepositoryError> {
        Ok(self
            .rows
            .lock()
            .get(id)
            .filter(|stored| !stored.disabled)
            .map(|stored| stored.rule.clone()))
    }

    async fn delete_rule(&self, id: &str) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock();
        let stored = rows
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        stored.disabled = true;
        Ok(())
    }

    async fn export(&self) -> Result<Vec<Rule>, RepositoryError> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|stored| !stored.disabled)
            .map(|stored| stored.rule.clone())
            .collect())
    }

    /// Wholesale replace: preserves each incoming rule's `version` verbatim,
    /// matching the SQLite implementation's import semantics.
    async fn import(&self, rules: Vec<Rule>) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock();
        rows.clear();
        for rule in rules {
            let rule = derive_and_stamp_id(rule)?;
            let id = rule.id.clone().expect("stamped above");
            let now = self.tick();
            rows.insert(
                id,
                StoredRule {
                    rule,
                    ctime: now,
                    mtime: now,
                    disabled: false,
                },
            );
        }
        Ok(())
    }
}
