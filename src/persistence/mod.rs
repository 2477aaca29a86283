//! SQLite persistence for hedge pair bookkeeping.
//!
//! Two small stores share one database:
//! - Trade groups: append-only audit trail of every opened hedge pair
//! - Unsupported symbols: instruments the exchange rejected, excluded from ranking
//!
//! Neither is the source of truth for current holdings; the exchange is.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Data needed to record a freshly opened hedge pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTradeGroup {
    pub exchange_id: String,
    pub symbol: String,
    pub spot_order_id: String,
    pub futures_order_id: String,
    pub leverage: u32,
}

/// A persisted hedge pair record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeGroup {
    pub id: i64,
    pub exchange_id: String,
    pub symbol: String,
    pub spot_order_id: String,
    pub futures_order_id: String,
    pub leverage: u32,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

impl TradeGroup {
    /// `exchange:symbol:spotOrder_futuresOrder_leverage`
    pub fn identifier(&self) -> String {
        format!(
            "{}:{}:{}_{}_{}",
            self.exchange_id, self.symbol, self.spot_order_id, self.futures_order_id, self.leverage
        )
    }
}

/// Append-only log of opened hedge pairs.
pub trait TradeGroupStore: Send + Sync {
    /// Record a new active trade group and return its row id.
    fn store_trade_group(&self, group: &NewTradeGroup) -> Result<i64>;

    /// All trade groups still marked active, oldest first.
    fn active_trade_groups(&self) -> Result<Vec<TradeGroup>>;

    /// Mark every active group of `symbol` as superseded. Returns rows touched.
    fn deactivate_trade_groups(&self, symbol: &str) -> Result<usize>;
}

/// Persisted set of symbols the exchange does not support.
pub trait UnsupportedSymbolStore: Send + Sync {
    fn unsupported_symbols(&self) -> Result<HashSet<String>>;

    /// Idempotent insert; returns `true` if the symbol was not yet known.
    fn add_unsupported_symbol(&self, symbol: &str) -> Result<bool>;
}

/// Everything the reconciler needs from storage.
pub trait HedgeStore: TradeGroupStore + UnsupportedSymbolStore {}

impl<T: TradeGroupStore + UnsupportedSymbolStore> HedgeStore for T {}

/// SQLite-backed implementation of both stores.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        let store = Self::from_connection(conn)?;

        info!("Trade store initialized at {:?}", path);
        Ok(store)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS trade_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                spot_order_id TEXT NOT NULL,
                futures_order_id TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trade_groups_symbol ON trade_groups(symbol);

            CREATE TABLE IF NOT EXISTS unsupported_symbols (
                symbol TEXT PRIMARY KEY,
                added_at TEXT NOT NULL
            );
            "#,
            )
            .context("Failed to initialize database schema")?;
        Ok(())
    }
}

impl TradeGroupStore for SqliteStore {
    fn store_trade_group(&self, group: &NewTradeGroup) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO trade_groups
                (exchange_id, symbol, spot_order_id, futures_order_id, leverage, active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
            "#,
            params![
                group.exchange_id,
                group.symbol,
                group.spot_order_id,
                group.futures_order_id,
                group.leverage,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to store trade group")?;

        let id = conn.last_insert_rowid();
        debug!(id, symbol = %group.symbol, "Stored trade group");
        Ok(id)
    }

    fn active_trade_groups(&self) -> Result<Vec<TradeGroup>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, exchange_id, symbol, spot_order_id, futures_order_id, leverage, active, created_at
            FROM trade_groups
            WHERE active = 1
            ORDER BY id
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            let created_at: String = row.get(7)?;
            Ok(TradeGroup {
                id: row.get(0)?,
                exchange_id: row.get(1)?,
                symbol: row.get(2)?,
                spot_order_id: row.get(3)?,
                futures_order_id: row.get(4)?,
                leverage: row.get(5)?,
                active: row.get::<_, i64>(6)? != 0,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;

        let groups = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load active trade groups")?;
        Ok(groups)
    }

    fn deactivate_trade_groups(&self, symbol: &str) -> Result<usize> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE trade_groups SET active = 0 WHERE symbol = ?1 AND active = 1",
                params![symbol],
            )
            .context("Failed to deactivate trade groups")?;
        if updated > 0 {
            debug!(%symbol, updated, "Deactivated trade groups");
        }
        Ok(updated)
    }
}

impl UnsupportedSymbolStore for SqliteStore {
    fn unsupported_symbols(&self) -> Result<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT symbol FROM unsupported_symbols")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let symbols = rows
            .collect::<rusqlite::Result<HashSet<_>>>()
            .context("Failed to load unsupported symbols")?;
        Ok(symbols)
    }

    fn add_unsupported_symbol(&self, symbol: &str) -> Result<bool> {
        let inserted = self
            .conn()?
            .execute(
                "INSERT OR IGNORE INTO unsupported_symbols (symbol, added_at) VALUES (?1, ?2)",
                params![symbol, Utc::now().to_rfc3339()],
            )
            .context("Failed to record unsupported symbol")?;
        Ok(inserted > 0)
    }
}
