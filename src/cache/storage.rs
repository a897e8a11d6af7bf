//! Snapshot storage backends.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::traits::{PersistenceGateway, Snapshot};
use crate::model::{Entity, ProjectRef, ResourceKind};
use crate::sync::CacheMetadata;

/// Storage implementation that doesn't persist anything.
/// Used when caching is disabled - every start is a cold start.
pub struct NoopStorage;

impl PersistenceGateway for NoopStorage {
  fn write(&self, _project: &ProjectRef, _snapshot: &Snapshot) -> Result<()> {
    Ok(()) // Discard
  }

  fn read_cached(&self, _project: &ProjectRef) -> Result<Option<Snapshot>> {
    Ok(None) // Always miss
  }
}

/// SQLite-based snapshot storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the storage at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("hubsync").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per persisted project
CREATE TABLE IF NOT EXISTS project_cache (
    project_hash TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Serialized entities, ordered per collection
CREATE TABLE IF NOT EXISTS entity_cache (
    project_hash TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (project_hash, entity_type, entity_key),
    FOREIGN KEY (project_hash) REFERENCES project_cache(project_hash) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entity_cache_order
    ON entity_cache(project_hash, entity_type, position);

-- Freshness tokens per resource kind
CREATE TABLE IF NOT EXISTS resource_meta (
    project_hash TEXT NOT NULL,
    resource TEXT NOT NULL,
    token TEXT,
    last_checked TEXT,
    PRIMARY KEY (project_hash, resource),
    FOREIGN KEY (project_hash) REFERENCES project_cache(project_hash) ON DELETE CASCADE
);
"#;

impl PersistenceGateway for SqliteStorage {
  fn write(&self, project: &ProjectRef, snapshot: &Snapshot) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let hash = project_hash(project);

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for table in ["entity_cache", "resource_meta"] {
      tx.execute(
        &format!("DELETE FROM {} WHERE project_hash = ?", table),
        params![hash],
      )
      .map_err(|e| eyre!("Failed to clear {}: {}", table, e))?;
    }

    tx.execute(
      "INSERT OR REPLACE INTO project_cache (project_hash, project, cached_at)
       VALUES (?, ?, datetime('now'))",
      params![hash, project.to_string()],
    )
    .map_err(|e| eyre!("Failed to update project cache: {}", e))?;

    store_entities(&tx, &hash, &snapshot.issues)?;
    store_entities(&tx, &hash, &snapshot.labels)?;
    store_entities(&tx, &hash, &snapshot.milestones)?;
    store_entities(&tx, &hash, &snapshot.collaborators)?;

    for (kind, meta) in snapshot.meta.iter() {
      tx.execute(
        "INSERT INTO resource_meta (project_hash, resource, token, last_checked)
         VALUES (?, ?, ?, ?)",
        params![
          hash,
          kind.as_str(),
          meta.token,
          meta.last_checked.map(|t| t.to_rfc3339())
        ],
      )
      .map_err(|e| eyre!("Failed to store resource metadata: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(project = %project, issues = snapshot.issues.len(), "Wrote snapshot");
    Ok(())
  }

  fn read_cached(&self, project: &ProjectRef) -> Result<Option<Snapshot>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let hash = project_hash(project);

    let known: Option<String> = conn
      .query_row(
        "SELECT cached_at FROM project_cache WHERE project_hash = ?",
        params![hash],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query project cache: {}", e))?;

    if known.is_none() {
      return Ok(None);
    }

    let mut meta = load_metadata(&conn, &hash)?;
    let (issues, bad_issues) = load_entities(&conn, &hash)?;
    let (labels, bad_labels) = load_entities(&conn, &hash)?;
    let (milestones, bad_milestones) = load_entities(&conn, &hash)?;
    let (collaborators, bad_collaborators) = load_entities(&conn, &hash)?;

    // A token vouches for the whole list; without every row it would hide the rest
    for (kind, unreadable) in [
      (ResourceKind::Issues, bad_issues),
      (ResourceKind::Labels, bad_labels),
      (ResourceKind::Milestones, bad_milestones),
      (ResourceKind::Collaborators, bad_collaborators),
    ] {
      if unreadable > 0 {
        warn!(project = %project, kind = %kind, unreadable, "Dropping freshness of partially readable cache");
        meta.forget(kind);
      }
    }

    Ok(Some(Snapshot {
      meta,
      issues,
      labels,
      milestones,
      collaborators,
    }))
  }
}

/// Stable, fixed-length storage key for a project (case-insensitive).
fn project_hash(project: &ProjectRef) -> String {
  let mut hasher = Sha256::new();
  hasher.update(project.to_string().to_lowercase().as_bytes());
  hex::encode(hasher.finalize())
}

fn store_entities<T: Entity>(tx: &Transaction<'_>, hash: &str, entities: &[T]) -> Result<()> {
  let entity_type = T::KIND.as_str();
  let mut stmt = tx
    .prepare(
      "INSERT OR REPLACE INTO entity_cache (project_hash, entity_type, entity_key, position, data)
       VALUES (?, ?, ?, ?, ?)",
    )
    .map_err(|e| eyre!("Failed to prepare entity insert: {}", e))?;

  for (position, entity) in entities.iter().enumerate() {
    let data =
      serde_json::to_vec(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;
    stmt
      .execute(params![hash, entity_type, entity.cache_key(), position, data])
      .map_err(|e| eyre!("Failed to store entity: {}", e))?;
  }

  Ok(())
}

/// Cached entities of one kind in stored order, plus the number of unreadable rows.
fn load_entities<T: Entity>(conn: &Connection, hash: &str) -> Result<(Vec<T>, usize)> {
  let mut stmt = conn
    .prepare(
      "SELECT data FROM entity_cache
       WHERE project_hash = ? AND entity_type = ?
       ORDER BY position",
    )
    .map_err(|e| eyre!("Failed to prepare entity query: {}", e))?;

  let rows: Vec<Vec<u8>> = stmt
    .query_map(params![hash, T::KIND.as_str()], |row| row.get(0))
    .map_err(|e| eyre!("Failed to query entities: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read entities: {}", e))?;

  let kind = T::KIND;
  let total = rows.len();
  let entities: Vec<T> = rows
    .iter()
    .filter_map(|data| match serde_json::from_slice(data) {
      Ok(entity) => Some(entity),
      Err(e) => {
        debug!(kind = %kind, "Skipping unreadable cached entity: {}", e);
        None
      }
    })
    .collect();

  let unreadable = total - entities.len();
  Ok((entities, unreadable))
}

fn load_metadata(conn: &Connection, hash: &str) -> Result<CacheMetadata> {
  let mut stmt = conn
    .prepare("SELECT resource, token, last_checked FROM resource_meta WHERE project_hash = ?")
    .map_err(|e| eyre!("Failed to prepare metadata query: {}", e))?;

  let rows: Vec<(String, Option<String>, Option<String>)> = stmt
    .query_map(params![hash], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
    .map_err(|e| eyre!("Failed to query metadata: {}", e))?
    .filter_map(|r| r.ok())
    .collect();

  let mut meta = CacheMetadata::default();
  for (resource, token, last_checked) in rows {
    let Some(kind) = ResourceKind::ALL.into_iter().find(|k| k.as_str() == resource) else {
      continue;
    };
    meta.set_token(kind, token);
    if let Some(at) = last_checked {
      meta.set_last_checked(kind, parse_datetime(&at)?);
    }
  }

  Ok(meta)
}

/// Parse an RFC 3339 timestamp as stored in `resource_meta`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
