//! Bundle persistence for the save/load endpoints.
//!
//! Bundles are content-addressed: the data table stores each distinct
//! bundle once under its hash, and the link table maps short opaque ids to
//! hashes. Multiple links may reference one data row, which keeps repeated
//! saves of the same bundle cheap and keeps link ids independent of the
//! bundle contents.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cache::fingerprint;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bundle_data (
    hash BLOB PRIMARY KEY,
    json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS bundle_link (
    id TEXT PRIMARY KEY,
    hash BLOB NOT NULL REFERENCES bundle_data(hash),
    created_at TEXT NOT NULL
);
";

const LINK_ID_ATTEMPTS: usize = 3;

/// JSON envelope shared by the save and load endpoints, field names as the
/// web client expects them.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StorageResponse {
    pub error: String,
    pub link: String,
    pub data: String,
}

impl StorageResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SavedBundle {
    pub link: String,
    pub data: String,
}

pub struct BundleStore {
    conn: Arc<Mutex<Connection>>,
}

impl BundleStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open bundle database {}", path.display()))?;
        conn.execute_batch(SCHEMA)
            .context("failed to create bundle tables")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Stores the bundle (once per distinct content) and a fresh link to
    /// it. Link id collisions are vanishingly rare but retried anyway.
    pub async fn save(&self, json: Vec<u8>) -> anyhow::Result<SavedBundle> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || save_blocking(&conn, json))
            .await
            .context("bundle save task panicked")?
    }

    /// Resolves a link id to its bundle. `Ok(None)` means the id is
    /// unknown.
    pub async fn load(&self, id: String) -> anyhow::Result<Option<SavedBundle>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || load_blocking(&conn, &id))
            .await
            .context("bundle load task panicked")?
    }
}

fn save_blocking(conn: &Mutex<Connection>, json: Vec<u8>) -> anyhow::Result<SavedBundle> {
    let hash = fingerprint(&json);
    let data = String::from_utf8_lossy(&json).into_owned();

    let mut conn = conn.lock().unwrap();
    for _ in 0..LINK_ID_ATTEMPTS {
        let id = random_link(&hash);
        let tx = conn.transaction().context("failed to open transaction")?;

        let taken: Option<String> = tx
            .query_row(
                "SELECT id FROM bundle_link WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to check link id")?;
        if taken.is_some() {
            continue;
        }

        let stored: Option<Vec<u8>> = tx
            .query_row(
                "SELECT hash FROM bundle_data WHERE hash = ?1",
                params![hash.as_slice()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to check bundle data")?;
        if stored.is_none() {
            tx.execute(
                "INSERT INTO bundle_data (hash, json) VALUES (?1, ?2)",
                params![hash.as_slice(), data],
            )
            .context("failed to store bundle data")?;
        }

        tx.execute(
            "INSERT INTO bundle_link (id, hash, created_at) VALUES (?1, ?2, ?3)",
            params![id, hash.as_slice(), chrono::Utc::now().to_rfc3339()],
        )
        .context("failed to store bundle link")?;

        tx.commit().context("failed to commit bundle save")?;
        return Ok(SavedBundle { link: id, data });
    }
    anyhow::bail!("link id collisions exhausted {LINK_ID_ATTEMPTS} attempts")
}

fn load_blocking(conn: &Mutex<Connection>, id: &str) -> anyhow::Result<Option<SavedBundle>> {
    let conn = conn.lock().unwrap();
    let data: Option<String> = conn
        .query_row(
            "SELECT bundle_data.json FROM bundle_link \
             JOIN bundle_data ON bundle_link.hash = bundle_data.hash \
             WHERE bundle_link.id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query bundle")?;
    Ok(data.map(|data| SavedBundle {
        link: id.to_string(),
        data,
    }))
}

/// Link ids are random, URL-safe, and begin with `_`: the hex digest of
/// (16 random bytes || bundle hash) with the first character replaced.
fn random_link(hash: &[u8; 32]) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(hash);
    let hex = format!("{:x}", hasher.finalize());
    format!("_{}", &hex[1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = BundleStore::open_in_memory().unwrap();
        let saved = store.save(b"{\"files\":[]}".to_vec()).await.unwrap();

        assert!(saved.link.starts_with('_'));
        assert_eq!(saved.link.len(), 64);

        let loaded = store.load(saved.link.clone()).await.unwrap().unwrap();
        assert_eq!(loaded.data, "{\"files\":[]}");
    }

    #[tokio::test]
    async fn unknown_link_is_none() {
        let store = BundleStore::open_in_memory().unwrap();
        assert!(store.load("_missing".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn identical_bundles_share_one_data_row() {
        let store = BundleStore::open_in_memory().unwrap();
        let first = store.save(b"same bundle".to_vec()).await.unwrap();
        let second = store.save(b"same bundle".to_vec()).await.unwrap();

        assert_ne!(first.link, second.link);

        let conn = store.conn.lock().unwrap();
        let data_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM bundle_data", [], |row| row.get(0))
            .unwrap();
        let link_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM bundle_link", [], |row| row.get(0))
            .unwrap();
        assert_eq!(data_rows, 1);
        assert_eq!(link_rows, 2);
    }

    #[test]
    fn link_ids_are_url_safe() {
        let hash = fingerprint(b"bundle");
        let id = random_link(&hash);
        assert!(id.starts_with('_'));
        assert!(id[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
