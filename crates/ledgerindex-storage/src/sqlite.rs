//! SQLite storage backend for LedgerIndex.
//!
//! Persists transfer events, processed-event markers, recorded block hashes,
//! and checkpoints to a single SQLite file. Uses `sqlx` with WAL mode for
//! concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use ledgerindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use ledgerindex_core::checkpoint::{Checkpoint, CheckpointStore};
use ledgerindex_core::error::IndexerError;
use ledgerindex_core::store::{BlockHashStore, EventStore, IndexStore, MarkerStore, RollbackOutcome};
use ledgerindex_core::types::{EventQuery, IndexStats, IndexedEvent, ProcessedEventMarker};

const EVENT_COLUMNS: &str = "event_key, block_number, block_hash, tx_hash, log_index, event_name, \
     contract, from_address, to_address, token_id, value, event_timestamp, created_at, updated_at";

fn db_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// Block numbers are stored as `BIGINT`; bounds past `i64::MAX` saturate.
fn sql_block(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// SQLite-backed implementation of every store trait.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Pinned to a single connection: every `:memory:` connection is its own
    /// database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        let statements = [
            "CREATE TABLE IF NOT EXISTS events (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                event_key       TEXT    NOT NULL UNIQUE,
                block_number    INTEGER NOT NULL,
                block_hash      TEXT,
                tx_hash         TEXT    NOT NULL,
                log_index       INTEGER NOT NULL,
                event_name      TEXT    NOT NULL,
                contract        TEXT    NOT NULL,
                from_address    TEXT    NOT NULL,
                to_address      TEXT    NOT NULL,
                token_id        TEXT,
                value           TEXT,
                event_timestamp INTEGER NOT NULL,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_events_tx_hash ON events (tx_hash);",
            "CREATE INDEX IF NOT EXISTS idx_events_contract ON events (contract);",
            "CREATE INDEX IF NOT EXISTS idx_events_block ON events (block_number);",
            "CREATE INDEX IF NOT EXISTS idx_events_name ON events (event_name);",
            "CREATE TABLE IF NOT EXISTS processed_event_markers (
                event_key    TEXT    PRIMARY KEY,
                block_number INTEGER NOT NULL,
                processed    INTEGER NOT NULL,
                processed_at INTEGER NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_markers_block ON processed_event_markers (block_number);",
            "CREATE TABLE IF NOT EXISTS block_hashes (
                chain_id     TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                PRIMARY KEY (chain_id, block_number)
            );",
            "CREATE TABLE IF NOT EXISTS checkpoints (
                chain_id     TEXT    PRIMARY KEY,
                block_number INTEGER NOT NULL,
                block_hash   TEXT,
                updated_at   INTEGER NOT NULL
            );",
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await.map_err(db_err)?;
        }

        debug!("SqliteStorage schema initialized");
        Ok(())
    }

    /// Get the underlying connection pool (for custom queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_events(
        &self,
        mut qb: QueryBuilder<'_, Sqlite>,
    ) -> Result<Vec<IndexedEvent>, IndexerError> {
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }
}

fn select_events() -> QueryBuilder<'static, Sqlite> {
    QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1 = 1"))
}

fn event_from_row(row: &SqliteRow) -> Result<IndexedEvent, IndexerError> {
    Ok(IndexedEvent {
        event_key: row.try_get("event_key").map_err(db_err)?,
        block_number: row.try_get::<i64, _>("block_number").map_err(db_err)? as u64,
        block_hash: row.try_get("block_hash").map_err(db_err)?,
        tx_hash: row.try_get("tx_hash").map_err(db_err)?,
        log_index: row.try_get::<i64, _>("log_index").map_err(db_err)? as u32,
        event_name: row.try_get("event_name").map_err(db_err)?,
        contract: row.try_get("contract").map_err(db_err)?,
        from: row.try_get("from_address").map_err(db_err)?,
        to: row.try_get("to_address").map_err(db_err)?,
        token_id: row.try_get("token_id").map_err(db_err)?,
        value: row.try_get("value").map_err(db_err)?,
        timestamp: row.try_get("event_timestamp").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

// ─── EventStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl EventStore for SqliteStorage {
    async fn insert_events(&self, events: &[IndexedEvent]) -> Result<u64, IndexerError> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut inserted = 0;
        for event in events {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO events (
                    event_key, block_number, block_hash, tx_hash, log_index, event_name,
                    contract, from_address, to_address, token_id, value,
                    event_timestamp, created_at, updated_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.event_key)
            .bind(sql_block(event.block_number))
            .bind(&event.block_hash)
            .bind(&event.tx_hash)
            .bind(i64::from(event.log_index))
            .bind(&event.event_name)
            .bind(&event.contract)
            .bind(&event.from)
            .bind(&event.to)
            .bind(&event.token_id)
            .bind(&event.value)
            .bind(event.timestamp)
            .bind(event.created_at)
            .bind(event.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            inserted += result.rows_affected();
        }
        tx.commit()
            .await
            .map_err(|e| IndexerError::Storage(format!("commit batch: {e}")))?;

        debug!(batch = events.len(), inserted, "events stored");
        Ok(inserted)
    }

    async fn event_by_tx_hash(&self, tx_hash: &str) -> Result<Option<IndexedEvent>, IndexerError> {
        let mut qb = select_events();
        qb.push(" AND tx_hash = ")
            .push_bind(tx_hash.to_ascii_lowercase())
            .push(" ORDER BY log_index LIMIT 1");
        Ok(self.fetch_events(qb).await?.into_iter().next())
    }

    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<IndexedEvent>, IndexerError> {
        let mut qb = select_events();
        qb.push(" AND block_number >= ")
            .push_bind(sql_block(from))
            .push(" AND block_number <= ")
            .push_bind(sql_block(to))
            .push(" ORDER BY block_number, log_index");
        self.fetch_events(qb).await
    }

    async fn events_at_block(&self, block_number: u64) -> Result<Vec<IndexedEvent>, IndexerError> {
        let mut qb = select_events();
        qb.push(" AND block_number = ")
            .push_bind(sql_block(block_number))
            .push(" ORDER BY log_index");
        self.fetch_events(qb).await
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<IndexedEvent>, IndexerError> {
        let mut qb = select_events();
        if let Some(kind) = query.kind {
            qb.push(" AND event_name = ").push_bind(kind.event_name());
        }
        if let Some(contract) = &query.contract {
            qb.push(" AND contract = ")
                .push_bind(contract.to_ascii_lowercase());
        }
        if let Some(from) = query.from_block {
            qb.push(" AND block_number >= ").push_bind(sql_block(from));
        }
        if let Some(to) = query.to_block {
            qb.push(" AND block_number <= ").push_bind(sql_block(to));
        }
        qb.push(" ORDER BY block_number, log_index LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(query.offset));
        self.fetch_events(qb).await
    }

    async fn latest_event_block(&self) -> Result<Option<u64>, IndexerError> {
        let row = sqlx::query("SELECT MAX(block_number) AS latest FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let latest: Option<i64> = row.try_get("latest").map_err(db_err)?;
        Ok(latest.map(|b| b as u64))
    }

    async fn event_stats(&self) -> Result<IndexStats, IndexerError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COUNT(DISTINCT contract) AS contracts,
                    MAX(block_number) AS latest
             FROM events",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(IndexStats {
            total_events: row.try_get::<i64, _>("total").map_err(db_err)? as u64,
            contracts: row.try_get::<i64, _>("contracts").map_err(db_err)? as u64,
            latest_block: row
                .try_get::<Option<i64>, _>("latest")
                .map_err(db_err)?
                .map(|b| b as u64),
        })
    }

    async fn delete_events_from(&self, block_number: u64) -> Result<u64, IndexerError> {
        let result = sqlx::query("DELETE FROM events WHERE block_number >= ?")
            .bind(sql_block(block_number))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

// ─── MarkerStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl MarkerStore for SqliteStorage {
    async fn insert_marker(&self, marker: &ProcessedEventMarker) -> Result<bool, IndexerError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO processed_event_markers
                (event_key, block_number, processed, processed_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&marker.key)
        .bind(sql_block(marker.block_number))
        .bind(marker.processed)
        .bind(marker.timestamp)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn marker_exists(&self, key: &str) -> Result<bool, IndexerError> {
        let row = sqlx::query("SELECT 1 FROM processed_event_markers WHERE event_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn delete_markers_from(&self, block_number: u64) -> Result<u64, IndexerError> {
        let result = sqlx::query("DELETE FROM processed_event_markers WHERE block_number >= ?")
            .bind(sql_block(block_number))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

// ─── BlockHashStore impl ─────────────────────────────────────────────────────

#[async_trait]
impl BlockHashStore for SqliteStorage {
    async fn record_block_hash(
        &self,
        chain_id: &str,
        block_number: u64,
        hash: &str,
    ) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO block_hashes (chain_id, block_number, block_hash)
             VALUES (?, ?, ?)",
        )
        .bind(chain_id)
        .bind(sql_block(block_number))
        .bind(hash)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn block_hash(
        &self,
        chain_id: &str,
        block_number: u64,
    ) -> Result<Option<String>, IndexerError> {
        let row = sqlx::query(
            "SELECT block_hash FROM block_hashes
             WHERE chain_id = ? AND block_number = ?",
        )
        .bind(chain_id)
        .bind(sql_block(block_number))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| r.try_get::<String, _>("block_hash"))
            .transpose()
            .map_err(db_err)
    }

    async fn prune_block_hashes_from(
        &self,
        chain_id: &str,
        block_number: u64,
    ) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM block_hashes WHERE chain_id = ? AND block_number >= ?")
            .bind(chain_id)
            .bind(sql_block(block_number))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load_checkpoint(&self, chain_id: &str) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT chain_id, block_number, block_hash, updated_at
             FROM checkpoints WHERE chain_id = ?",
        )
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(r) = row else {
            return Ok(None);
        };
        Ok(Some(Checkpoint {
            chain_id: r.try_get("chain_id").map_err(db_err)?,
            block_number: r.try_get::<i64, _>("block_number").map_err(db_err)? as u64,
            block_hash: r.try_get("block_hash").map_err(db_err)?,
            updated_at: r.try_get("updated_at").map_err(db_err)?,
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints (chain_id, block_number, block_hash, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&checkpoint.chain_id)
        .bind(sql_block(checkpoint.block_number))
        .bind(&checkpoint.block_hash)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(
            chain_id = %checkpoint.chain_id,
            block = checkpoint.block_number,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete_checkpoint(&self, chain_id: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE chain_id = ?")
            .bind(chain_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ─── IndexStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl IndexStore for SqliteStorage {
    /// Deletes events, markers, and hashes at or above `block_number` in one
    /// transaction.
    async fn rollback_from(
        &self,
        chain_id: &str,
        block_number: u64,
    ) -> Result<RollbackOutcome, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let events = sqlx::query("DELETE FROM events WHERE block_number >= ?")
            .bind(sql_block(block_number))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let markers = sqlx::query("DELETE FROM processed_event_markers WHERE block_number >= ?")
            .bind(sql_block(block_number))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM block_hashes WHERE chain_id = ? AND block_number >= ?")
            .bind(chain_id)
            .bind(sql_block(block_number))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit()
            .await
            .map_err(|e| IndexerError::Storage(format!("commit rollback: {e}")))?;

        let outcome = RollbackOutcome {
            events_removed: events.rows_affected(),
            markers_removed: markers.rows_affected(),
        };
        debug!(chain_id, block_number, ?outcome, "rolled back storage");
        Ok(outcome)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerindex_core::types::{TransferKind, TransferLog};

    const NFT: &str = "0x1111111111111111111111111111111111111111";
    const TOKEN: &str = "0x2222222222222222222222222222222222222222";

    fn event(kind: TransferKind, contract: &str, block: u64, tx: &str, log_index: u32) -> IndexedEvent {
        TransferLog {
            kind,
            contract: contract.into(),
            from: "0x000000000000000000000000000000000000dEaD".into(),
            to: "0x3333333333333333333333333333333333333333".into(),
            discriminator: format!("{}", block * 10 + log_index as u64),
            block_number: block,
            block_hash: Some(format!("0x{block:064x}")),
            tx_hash: tx.into(),
            log_index,
            timestamp: None,
        }
        .into_event(1_700_000_000 + block as i64)
    }

    // ── Events ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_is_idempotent_by_event_key() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let a = event(TransferKind::Nft, NFT, 100, "0xAA", 0);
        let b = event(TransferKind::Token, TOKEN, 100, "0xAA", 1);

        assert_eq!(store.insert_events(&[a.clone(), b.clone()]).await.unwrap(), 2);
        assert_eq!(store.insert_events(&[a, b]).await.unwrap(), 0);
        assert_eq!(store.event_stats().await.unwrap().total_events, 2);
    }

    #[tokio::test]
    async fn duplicate_inside_one_batch_is_skipped() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let a = event(TransferKind::Nft, NFT, 7, "0xbb", 0);
        assert_eq!(store.insert_events(&[a.clone(), a]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lookup_by_tx_hash_is_case_insensitive() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store
            .insert_events(&[
                event(TransferKind::Token, TOKEN, 5, "0xABCDEF", 3),
                event(TransferKind::Nft, NFT, 5, "0xABCDEF", 1),
            ])
            .await
            .unwrap();

        let found = store.event_by_tx_hash("0xAbCdEf").await.unwrap().unwrap();
        assert_eq!(found.log_index, 1);
        assert_eq!(found.tx_hash, "0xabcdef");
        assert!(store.event_by_tx_hash("0xffff").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unbounded_range_does_not_wrap() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store
            .insert_events(&[event(TransferKind::Nft, NFT, 10, "0xcc", 0)])
            .await
            .unwrap();

        assert_eq!(store.events_in_range(0, u64::MAX).await.unwrap().len(), 1);
        let query = EventQuery {
            from_block: Some(0),
            to_block: Some(u64::MAX),
            limit: u32::MAX,
            ..EventQuery::default()
        };
        assert_eq!(store.query_events(&query).await.unwrap().len(), 1);
        assert!(store.events_in_range(u64::MAX, u64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn range_and_block_queries() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let events: Vec<_> = (10u64..15)
            .map(|b| event(TransferKind::Token, TOKEN, b, &format!("0x{b:x}"), 0))
            .collect();
        store.insert_events(&events).await.unwrap();

        let range = store.events_in_range(11, 13).await.unwrap();
        assert_eq!(
            range.iter().map(|e| e.block_number).collect::<Vec<_>>(),
            vec![11, 12, 13]
        );
        assert_eq!(store.events_at_block(14).await.unwrap().len(), 1);
        assert!(store.events_at_block(99).await.unwrap().is_empty());
        assert_eq!(store.latest_event_block().await.unwrap(), Some(14));
    }

    #[tokio::test]
    async fn filtered_query_with_paging() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut events = Vec::new();
        for b in 1u64..=6 {
            events.push(event(TransferKind::Nft, NFT, b, &format!("0xa{b}"), 0));
            events.push(event(TransferKind::Token, TOKEN, b, &format!("0xb{b}"), 0));
        }
        store.insert_events(&events).await.unwrap();

        let query = EventQuery {
            kind: Some(TransferKind::Nft),
            contract: Some(NFT.into()),
            from_block: Some(2),
            to_block: Some(5),
            limit: 2,
            offset: 1,
        };
        let page = store.query_events(&query).await.unwrap();
        assert_eq!(
            page.iter().map(|e| e.block_number).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert!(page.iter().all(|e| e.event_name == "NFTTransfer"));
        assert!(page.iter().all(|e| e.token_id.is_some() && e.value.is_none()));
    }

    #[tokio::test]
    async fn stats_on_empty_and_populated_tables() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let empty = store.event_stats().await.unwrap();
        assert_eq!(empty, IndexStats::default());
        assert_eq!(store.latest_event_block().await.unwrap(), None);

        store
            .insert_events(&[
                event(TransferKind::Nft, NFT, 3, "0x1", 0),
                event(TransferKind::Token, TOKEN, 9, "0x2", 0),
                event(TransferKind::Token, TOKEN, 4, "0x3", 0),
            ])
            .await
            .unwrap();
        let stats = store.event_stats().await.unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.contracts, 2);
        assert_eq!(stats.latest_block, Some(9));
    }

    // ── Markers ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn marker_insert_or_ignore() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let marker = ProcessedEventMarker::new("nft:0x1:0x5:0xaa", 40);

        assert!(!store.marker_exists(&marker.key).await.unwrap());
        assert!(store.insert_marker(&marker).await.unwrap());
        assert!(!store.insert_marker(&marker).await.unwrap());
        assert!(store.marker_exists(&marker.key).await.unwrap());
    }

    // ── Block hashes & checkpoints ────────────────────────────────────────────

    #[tokio::test]
    async fn block_hash_upsert_and_chain_isolation() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.record_block_hash("1", 100, "0xAAA").await.unwrap();
        store.record_block_hash("1", 100, "0xBBB").await.unwrap();
        store.record_block_hash("137", 100, "0xPOL").await.unwrap();

        assert_eq!(store.block_hash("1", 100).await.unwrap().unwrap(), "0xBBB");
        assert_eq!(store.block_hash("137", 100).await.unwrap().unwrap(), "0xPOL");
        assert!(store.block_hash("1", 999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_save_load_delete() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.load_checkpoint("1").await.unwrap().is_none());

        let cp = Checkpoint {
            chain_id: "1".into(),
            block_number: 2_000,
            block_hash: None,
            updated_at: 1_700_000_000,
        };
        store.save_checkpoint(&cp).await.unwrap();
        assert_eq!(store.load_checkpoint("1").await.unwrap(), Some(cp.clone()));

        let later = Checkpoint {
            block_number: 2_500,
            block_hash: Some("0xfeed".into()),
            ..cp
        };
        store.save_checkpoint(&later).await.unwrap();
        assert_eq!(store.load_checkpoint("1").await.unwrap(), Some(later));

        store.delete_checkpoint("1").await.unwrap();
        assert!(store.load_checkpoint("1").await.unwrap().is_none());
    }

    // ── Reorg / rollback ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn rollback_removes_everything_at_or_above_block() {
        let store = SqliteStorage::in_memory().await.unwrap();
        for b in 36u64..=44 {
            let ev = event(TransferKind::Token, TOKEN, b, &format!("0x{b:x}"), 0);
            store.insert_events(&[ev.clone()]).await.unwrap();
            store
                .insert_marker(&ProcessedEventMarker::new(ev.event_key, b))
                .await
                .unwrap();
            store
                .record_block_hash("1", b, &format!("0x{b:064x}"))
                .await
                .unwrap();
        }
        store.record_block_hash("137", 50, "0xPOL").await.unwrap();

        let outcome = store.rollback_from("1", 40).await.unwrap();
        assert_eq!(outcome.events_removed, 5);
        assert_eq!(outcome.markers_removed, 5);

        assert_eq!(store.latest_event_block().await.unwrap(), Some(39));
        assert!(store.block_hash("1", 40).await.unwrap().is_none());
        assert!(store.block_hash("1", 39).await.unwrap().is_some());
        assert_eq!(store.block_hash("137", 50).await.unwrap().unwrap(), "0xPOL");
    }

    #[tokio::test]
    async fn file_backed_database_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "ledgerindex-sqlite-{}-{}.db",
            std::process::id(),
            nonce()
        ));
        let path_str = path.to_string_lossy().to_string();
        {
            let store = SqliteStorage::open(&path_str).await.unwrap();
            store
                .insert_events(&[event(TransferKind::Nft, NFT, 1, "0x1", 0)])
                .await
                .unwrap();
            store.pool().close().await;
        }
        let reopened = SqliteStorage::open(&path_str).await.unwrap();
        assert_eq!(reopened.event_stats().await.unwrap().total_events, 1);
        reopened.pool().close().await;
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{path_str}{suffix}"));
        }
    }

    fn nonce() -> u128 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
    }
}
