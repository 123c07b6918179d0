use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use amp_core::store::{Root, Store};

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventRow {
    pub id: i64,
    pub time: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("amp.sqlite");
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Busy timeout (default 5000ms; override with AMP_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("AMP_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        // Negative = KB units
        let cache_pages: i64 = std::env::var("AMP_SQLITE_CACHE_PAGES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(-20000);
        let _ = conn.pragma_update(None, "cache_size", cache_pages);
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        tracing::debug!(path = %db_path.display(), "kernel opened");
        Ok(Self { db_path })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- One serialized root per vat; replaced wholesale on every commit
            CREATE TABLE IF NOT EXISTS vat_images (
              name TEXT PRIMARY KEY,
              image TEXT NOT NULL,
              updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              time TEXT NOT NULL,
              kind TEXT NOT NULL,
              payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            CREATE INDEX IF NOT EXISTS idx_events_time ON events(time);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn load_image(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let image = conn
            .query_row(
                "SELECT image FROM vat_images WHERE name=?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(image)
    }

    pub fn save_image(&self, name: &str, image: &str) -> Result<()> {
        let conn = self.conn()?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO vat_images(name,image,updated) VALUES (?,?,?)
             ON CONFLICT(name) DO UPDATE SET image=excluded.image, updated=excluded.updated",
            params![name, image, now],
        )?;
        Ok(())
    }

    pub fn append_event(&self, env: &amp_events::Envelope) -> Result<i64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("INSERT INTO events(time,kind,payload) VALUES (?,?,?)")?;
        let payload = serde_json::to_string(&env.payload).unwrap_or("{}".to_string());
        stmt.execute(params![env.time, env.kind, payload])?;
        Ok(conn.last_insert_rowid())
    }

    /// Events in ascending id order: the newest `limit`, or the first
    /// `limit` after `after_id`.
    pub fn recent_events(&self, limit: i64, after_id: Option<i64>) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        let mut stmt_after;
        let mut stmt_all;
        let mut rows = if let Some(aid) = after_id {
            stmt_after = conn.prepare(
                "SELECT id,time,kind,payload FROM events WHERE id>? ORDER BY id ASC LIMIT ?",
            )?;
            stmt_after.query(params![aid, limit])?
        } else {
            stmt_all =
                conn.prepare("SELECT id,time,kind,payload FROM events ORDER BY id DESC LIMIT ?")?;
            stmt_all.query(params![limit])?
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload_s: String = row.get(3)?;
            out.push(EventRow {
                id: row.get(0)?,
                time: row.get(1)?,
                kind: row.get(2)?,
                payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
            });
        }
        if after_id.is_none() {
            out.reverse();
        }
        Ok(out)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------

    pub async fn append_event_async(&self, env: &amp_events::Envelope) -> Result<i64> {
        let k = self.clone();
        let env = env.clone();
        tokio::task::spawn_blocking(move || k.append_event(&env))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn recent_events_async(&self, limit: i64, after_id: Option<i64>) -> Result<Vec<EventRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.recent_events(limit, after_id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}

/// Vat image kept in the kernel's `vat_images` table under `name`.
#[derive(Clone)]
pub struct KernelStore {
    kernel: Kernel,
    name: String,
}

impl KernelStore {
    pub fn new(kernel: Kernel, name: impl Into<String>) -> Self {
        Self {
            kernel,
            name: name.into(),
        }
    }
}

impl Store for KernelStore {
    fn load(&self) -> Result<Option<Root>> {
        match self.kernel.load_image(&self.name)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save(&mut self, root: &Root) -> Result<()> {
        let raw = serde_json::to_string(root)?;
        self.kernel.save_image(&self.name, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: &str, n: i64) -> amp_events::Envelope {
        amp_events::Envelope {
            time: chrono::Utc::now().to_rfc3339(),
            kind: kind.to_string(),
            payload: json!({ "n": n }),
        }
    }

    #[test]
    fn images_are_replaced_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        assert!(kernel.load_image("a").unwrap().is_none());
        kernel.save_image("a", "{\"v\":1}").unwrap();
        kernel.save_image("a", "{\"v\":2}").unwrap();
        kernel.save_image("b", "{}").unwrap();
        assert_eq!(kernel.load_image("a").unwrap().as_deref(), Some("{\"v\":2}"));
        let reopened = Kernel::open(dir.path()).unwrap();
        assert_eq!(reopened.load_image("b").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn kernel_store_round_trips_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let mut store = KernelStore::new(kernel.clone(), "vat");
        assert!(store.load().unwrap().is_none());
        let mut root = Root::default();
        root.link("drum", json!("K1"));
        store.save(&root).unwrap();
        let other = KernelStore::new(kernel, "vat");
        assert_eq!(other.load().unwrap(), Some(root));
    }

    #[test]
    fn recent_events_are_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        for n in 0..5 {
            kernel.append_event(&envelope("amp.msg.sent", n)).unwrap();
        }
        let tail = kernel.recent_events(2, None).unwrap();
        assert_eq!(
            tail.iter().map(|e| e.payload["n"].as_i64()).collect::<Vec<_>>(),
            vec![Some(3), Some(4)]
        );
        let after = kernel.recent_events(10, Some(tail[0].id)).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].kind, "amp.msg.sent");
    }

    #[tokio::test]
    async fn async_wrappers_use_the_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let id = kernel
            .append_event_async(&envelope("amp.vat.revived", 1))
            .await
            .unwrap();
        let rows = kernel.recent_events_async(10, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
    }
}
