use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

use super::entities::{Budget, Customer, RateLimit, Team, VirtualKey};
use super::store::GovernanceDelta;

/// Opaque dashboard session persisted alongside the governance entities.
#[derive(Clone, Serialize, Deserialize)]
pub struct AdminSession {
    pub token: String,
    pub subject: String,
    pub expires_at: u64,
}

impl std::fmt::Debug for AdminSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSession")
            .field("token", &"<redacted>")
            .field("subject", &self.subject)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Write-through backing store for governance state. Control-plane mutations
/// must succeed here before they are applied in memory; the usage flusher
/// pushes coalesced counter snapshots through the same interface.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<GovernanceDelta>>;
    async fn apply(&self, deltas: &[GovernanceDelta]) -> Result<()>;
    async fn get_session(&self, token: &str) -> Result<Option<AdminSession>>;
    async fn put_session(&self, session: &AdminSession) -> Result<()>;
}

fn entity_key(delta: &GovernanceDelta) -> (&'static str, String) {
    match delta {
        GovernanceDelta::UpsertCustomer(c) => ("customers", c.id.clone()),
        GovernanceDelta::DeleteCustomer { id } => ("customers", id.clone()),
        GovernanceDelta::UpsertTeam(t) => ("teams", t.id.clone()),
        GovernanceDelta::DeleteTeam { id } => ("teams", id.clone()),
        GovernanceDelta::UpsertVirtualKey(vk) => ("virtual_keys", vk.id.clone()),
        GovernanceDelta::DeleteVirtualKey { id } => ("virtual_keys", id.clone()),
        GovernanceDelta::UpsertBudget(b) => ("budgets", b.id.clone()),
        GovernanceDelta::DeleteBudget { id } => ("budgets", id.clone()),
        GovernanceDelta::UpsertRateLimit(rl) => ("rate_limits", rl.id.clone()),
        GovernanceDelta::DeleteRateLimit { id } => ("rate_limits", id.clone()),
    }
}

fn is_delete(delta: &GovernanceDelta) -> bool {
    matches!(
        delta,
        GovernanceDelta::DeleteCustomer { .. }
            | GovernanceDelta::DeleteTeam { .. }
            | GovernanceDelta::DeleteVirtualKey { .. }
            | GovernanceDelta::DeleteBudget { .. }
            | GovernanceDelta::DeleteRateLimit { .. }
    )
}

/// In-memory config store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryConfigStore {
    entities: Mutex<BTreeMap<(&'static str, String), GovernanceDelta>>,
    sessions: Mutex<BTreeMap<String, AdminSession>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load_all(&self) -> Result<Vec<GovernanceDelta>> {
        let entities = self.entities.lock().expect("memory store poisoned");
        Ok(entities.values().cloned().collect())
    }

    async fn apply(&self, deltas: &[GovernanceDelta]) -> Result<()> {
        let mut entities = self.entities.lock().expect("memory store poisoned");
        for delta in deltas {
            let key = entity_key(delta);
            if is_delete(delta) {
                entities.remove(&key);
            } else {
                entities.insert(key, delta.clone());
            }
        }
        Ok(())
    }

    async fn get_session(&self, token: &str) -> Result<Option<AdminSession>> {
        let sessions = self.sessions.lock().expect("memory store poisoned");
        Ok(sessions.get(token).cloned())
    }

    async fn put_session(&self, session: &AdminSession) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("memory store poisoned");
        sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }
}

/// SQLite-backed config store: one table per entity kind, JSON value per row.
/// Every call opens a connection inside `spawn_blocking`; the gateway's hot
/// path never touches this directly.
#[derive(Clone, Debug)]
pub struct SqliteConfigStore {
    path: PathBuf,
}

const ENTITY_TABLES: [&str; 5] = ["customers", "teams", "virtual_keys", "budgets", "rate_limits"];

impl SqliteConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<()> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)
        })
        .await
    }
}

fn open_connection(path: &Path) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path).map_err(sqlite_error)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(sqlite_error)?;
    Ok(conn)
}

fn init_schema(conn: &rusqlite::Connection) -> Result<()> {
    for table in ENTITY_TABLES {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                     id TEXT PRIMARY KEY,
                     value_json TEXT NOT NULL
                 )"
            ),
            [],
        )
        .map_err(sqlite_error)?;
    }
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
             token TEXT PRIMARY KEY,
             value_json TEXT NOT NULL
         )",
        [],
    )
    .map_err(sqlite_error)?;
    Ok(())
}

fn sqlite_error(err: rusqlite::Error) -> GatewayError {
    GatewayError::Internal(format!("sqlite error: {err}"))
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| GatewayError::Internal(format!("sqlite join error: {err}")))?
}

fn upsert_row(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    id: &str,
    value_json: &str,
) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO {table} (id, value_json) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET value_json = excluded.value_json"
        ),
        rusqlite::params![id, value_json],
    )
    .map_err(sqlite_error)?;
    Ok(())
}

fn delete_row(tx: &rusqlite::Transaction<'_>, table: &str, id: &str) -> Result<()> {
    tx.execute(
        &format!("DELETE FROM {table} WHERE id = ?1"),
        rusqlite::params![id],
    )
    .map_err(sqlite_error)?;
    Ok(())
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn load_all(&self) -> Result<Vec<GovernanceDelta>> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;

            let mut deltas = Vec::new();
            for table in ENTITY_TABLES {
                let mut stmt = conn
                    .prepare(&format!("SELECT value_json FROM {table} ORDER BY id"))
                    .map_err(sqlite_error)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(sqlite_error)?;
                for row in rows {
                    let raw = row.map_err(sqlite_error)?;
                    let delta = match table {
                        "customers" => {
                            GovernanceDelta::UpsertCustomer(serde_json::from_str::<Customer>(&raw)?)
                        }
                        "teams" => GovernanceDelta::UpsertTeam(serde_json::from_str::<Team>(&raw)?),
                        "virtual_keys" => GovernanceDelta::UpsertVirtualKey(
                            serde_json::from_str::<VirtualKey>(&raw)?,
                        ),
                        "budgets" => {
                            GovernanceDelta::UpsertBudget(serde_json::from_str::<Budget>(&raw)?)
                        }
                        _ => GovernanceDelta::UpsertRateLimit(serde_json::from_str::<RateLimit>(
                            &raw,
                        )?),
                    };
                    deltas.push(delta);
                }
            }
            Ok(deltas)
        })
        .await
    }

    async fn apply(&self, deltas: &[GovernanceDelta]) -> Result<()> {
        let path = self.path.clone();
        let deltas = deltas.to_vec();
        run_blocking(move || {
            let mut conn = open_connection(&path)?;
            init_schema(&conn)?;
            let tx = conn.transaction().map_err(sqlite_error)?;
            for delta in &deltas {
                let (table, id) = entity_key(delta);
                if is_delete(delta) {
                    delete_row(&tx, table, &id)?;
                } else {
                    let value_json = match delta {
                        GovernanceDelta::UpsertCustomer(c) => serde_json::to_string(c)?,
                        GovernanceDelta::UpsertTeam(t) => serde_json::to_string(t)?,
                        GovernanceDelta::UpsertVirtualKey(vk) => serde_json::to_string(vk)?,
                        GovernanceDelta::UpsertBudget(b) => serde_json::to_string(b)?,
                        GovernanceDelta::UpsertRateLimit(rl) => serde_json::to_string(rl)?,
                        _ => unreachable!("delete handled above"),
                    };
                    upsert_row(&tx, table, &id, &value_json)?;
                }
            }
            tx.commit().map_err(sqlite_error)?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, token: &str) -> Result<Option<AdminSession>> {
        let path = self.path.clone();
        let token = token.to_string();
        run_blocking(move || {
            use rusqlite::OptionalExtension;
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM sessions WHERE token = ?1",
                    rusqlite::params![token],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_error)?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put_session(&self, session: &AdminSession) -> Result<()> {
        let path = self.path.clone();
        let token = session.token.clone();
        let value_json = serde_json::to_string(session)?;
        run_blocking(move || {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO sessions (token, value_json) VALUES (?1, ?2)
                 ON CONFLICT(token) DO UPDATE SET value_json = excluded.value_json",
                rusqlite::params![token, value_json],
            )
            .map_err(sqlite_error)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::entities::new_entity_id;

    fn sample_vk(value: &str) -> VirtualKey {
        VirtualKey {
            id: new_entity_id(),
            value: value.to_string(),
            name: value.to_string(),
            enabled: true,
            team_id: None,
            budget_id: None,
            rate_limit_id: None,
            provider_configs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn memory_store_upsert_then_delete_round_trip() {
        let store = MemoryConfigStore::new();
        let vk = sample_vk("vk-mem");
        let vk_id = vk.id.clone();
        store
            .apply(&[GovernanceDelta::UpsertVirtualKey(vk)])
            .await
            .unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        store
            .apply(&[GovernanceDelta::DeleteVirtualKey { id: vk_id }])
            .await
            .unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("prism-sqlite-{}", new_entity_id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("governance.db");

        let budget = Budget::new(5.0, 3600, 0);
        let budget_id = budget.id.clone();
        {
            let store = SqliteConfigStore::new(&path);
            store.init().await.unwrap();
            store
                .apply(&[
                    GovernanceDelta::UpsertBudget(budget),
                    GovernanceDelta::UpsertVirtualKey(sample_vk("vk-sql")),
                ])
                .await
                .unwrap();
        }

        let reopened = SqliteConfigStore::new(&path);
        let loaded = reopened.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(
            |d| matches!(d, GovernanceDelta::UpsertBudget(b) if b.id == budget_id && b.max_limit == 5.0)
        ));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn sqlite_sessions_round_trip() {
        let dir = std::env::temp_dir().join(format!("prism-sess-{}", new_entity_id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("governance.db");

        let store = SqliteConfigStore::new(&path);
        let session = AdminSession {
            token: "tok-1".to_string(),
            subject: "admin".to_string(),
            expires_at: 4200,
        };
        store.put_session(&session).await.unwrap();

        let loaded = store.get_session("tok-1").await.unwrap().unwrap();
        assert_eq!(loaded.subject, "admin");
        assert_eq!(loaded.expires_at, 4200);
        assert!(store.get_session("tok-2").await.unwrap().is_none());

        std::fs::remove_dir_all(&dir).ok();
    }
}
