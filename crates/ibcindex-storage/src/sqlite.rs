//! SQLite storage backend for ibcindex.
//!
//! Persists the read model and watcher checkpoints to a single SQLite file.
//! Each table carries its natural-key columns (plus the columns queries
//! filter on) and the full row as a JSON `body`.
//!
//! Packet writes are a compare-and-swap on `revision`. Sequence assignment
//! and the write it belongs to happen under one in-process write lock, so a
//! reader that sees `last_write_seq() == n` sees every row up to `n`.
//!
//! # Usage
//! ```rust,no_run
//! use ibcindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./ibcindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use ibcindex_core::anomaly::Anomaly;
use ibcindex_core::checkpoint::{Checkpoint, CheckpointStore};
use ibcindex_core::error::{IndexerError, Result};
use ibcindex_core::event::HandshakeStep;
use ibcindex_core::model::{
    ChainRow, ChannelRow, ClientRow, ClientTipRow, ConnectionRow, DailyCountRow, EffectKind,
    FungibleAssetOrderRow, HandshakeEntity, HandshakeEventRow, IndexStatusRow,
    LightClientUpdateRow, PacketEffectRow, PacketRow, StatisticsAddressRow, StatisticsRow,
    StatsSnapshot, StatusCounts, TransferRow,
};
use ibcindex_core::store::ReadModelStore;
use ibcindex_core::types::{
    ChannelKey, ClientKey, ConnectionKey, Height, IbcVersion, PacketKey, PacketStatus,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS checkpoints (
        chain_id     TEXT    NOT NULL,
        indexer_id   TEXT    NOT NULL,
        height       INTEGER NOT NULL,
        block_hash   TEXT    NOT NULL,
        updated_at   INTEGER NOT NULL,
        PRIMARY KEY (chain_id, indexer_id)
    );",
    "CREATE TABLE IF NOT EXISTS chains (
        chain_id TEXT PRIMARY KEY,
        body     TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS clients (
        ibc       TEXT NOT NULL,
        chain_id  TEXT NOT NULL,
        client_id TEXT NOT NULL,
        body      TEXT NOT NULL,
        PRIMARY KEY (ibc, chain_id, client_id)
    );",
    "CREATE TABLE IF NOT EXISTS client_tips (
        ibc       TEXT NOT NULL,
        chain_id  TEXT NOT NULL,
        client_id TEXT NOT NULL,
        body      TEXT NOT NULL,
        PRIMARY KEY (ibc, chain_id, client_id)
    );",
    "CREATE TABLE IF NOT EXISTS light_client_updates (
        ibc             TEXT    NOT NULL,
        chain_id        TEXT    NOT NULL,
        client_id       TEXT    NOT NULL,
        revision_number INTEGER NOT NULL,
        revision_height INTEGER NOT NULL,
        body            TEXT    NOT NULL,
        PRIMARY KEY (ibc, chain_id, client_id, revision_number, revision_height)
    );",
    "CREATE TABLE IF NOT EXISTS connections (
        ibc           TEXT NOT NULL,
        chain_id      TEXT NOT NULL,
        connection_id TEXT NOT NULL,
        body          TEXT NOT NULL,
        PRIMARY KEY (ibc, chain_id, connection_id)
    );",
    "CREATE TABLE IF NOT EXISTS channels (
        ibc        TEXT NOT NULL,
        chain_id   TEXT NOT NULL,
        port_id    TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        body       TEXT NOT NULL,
        PRIMARY KEY (ibc, chain_id, port_id, channel_id)
    );",
    "CREATE TABLE IF NOT EXISTS handshake_events (
        entity TEXT NOT NULL,
        step   TEXT NOT NULL,
        body   TEXT NOT NULL,
        PRIMARY KEY (entity, step)
    );",
    "CREATE TABLE IF NOT EXISTS packets (
        ibc               TEXT    NOT NULL,
        source_chain_id   TEXT    NOT NULL,
        source_channel_id TEXT    NOT NULL,
        source_port_id    TEXT    NOT NULL,
        sequence          INTEGER NOT NULL,
        status            TEXT    NOT NULL,
        revision          INTEGER NOT NULL,
        write_seq         INTEGER NOT NULL,
        created_seq       INTEGER NOT NULL,
        body              TEXT    NOT NULL,
        PRIMARY KEY (ibc, source_chain_id, source_channel_id, source_port_id, sequence)
    );",
    "CREATE INDEX IF NOT EXISTS idx_packets_created ON packets (created_seq);",
    "CREATE TABLE IF NOT EXISTS packet_effects (
        packet_key TEXT NOT NULL,
        event_id   TEXT NOT NULL,
        kind       TEXT NOT NULL,
        chain_id   TEXT NOT NULL,
        body       TEXT NOT NULL,
        PRIMARY KEY (packet_key, event_id)
    );",
    "CREATE INDEX IF NOT EXISTS idx_effects_kind ON packet_effects (kind, chain_id);",
    "CREATE TABLE IF NOT EXISTS transfers (
        packet_key  TEXT    PRIMARY KEY,
        root_key    TEXT,
        write_seq   INTEGER NOT NULL,
        created_seq INTEGER NOT NULL,
        body        TEXT    NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_transfers_root ON transfers (root_key);",
    "CREATE INDEX IF NOT EXISTS idx_transfers_created ON transfers (created_seq);",
    "CREATE TABLE IF NOT EXISTS fungible_asset_orders (
        packet_key TEXT PRIMARY KEY,
        body       TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS block_times (
        chain_id TEXT    NOT NULL,
        height   INTEGER NOT NULL,
        time     TEXT    NOT NULL,
        PRIMARY KEY (chain_id, height)
    );",
    "CREATE TABLE IF NOT EXISTS daily_packets (
        day   TEXT    PRIMARY KEY,
        count INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS daily_transfers (
        day   TEXT    PRIMARY KEY,
        count INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS statistics_address (
        address            TEXT    PRIMARY KEY,
        transfers_sent     INTEGER NOT NULL,
        transfers_received INTEGER NOT NULL,
        first_seen         TEXT    NOT NULL,
        last_seen          TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS statistics (
        id        INTEGER PRIMARY KEY CHECK (id = 1),
        body      TEXT    NOT NULL,
        watermark INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS index_status (
        chain_id TEXT PRIMARY KEY,
        body     TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS anomalies (
        id          TEXT    PRIMARY KEY,
        observed_us INTEGER NOT NULL,
        body        TEXT    NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_anomalies_observed ON anomalies (observed_us);",
];

fn db(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| IndexerError::Storage(e.to_string()))
}

fn body<T: DeserializeOwned>(row: &SqliteRow) -> Result<T> {
    let text: String = row.try_get("body").map_err(db)?;
    serde_json::from_str(&text)
        .map_err(|e| IndexerError::Storage(format!("corrupt row body: {e}")))
}

fn bodies<T: DeserializeOwned>(rows: &[SqliteRow]) -> Result<Vec<T>> {
    rows.iter().map(body).collect()
}

fn effect_order(e: &PacketEffectRow) -> (EffectKind, u64, Option<u32>, u32) {
    (e.kind, e.event.height, e.event.transaction_index, e.event.event_index)
}

fn effect_kind(kind: EffectKind) -> &'static str {
    match kind {
        EffectKind::Send => "SEND",
        EffectKind::Recv => "RECV",
        EffectKind::WriteAck => "WRITE_ACK",
        EffectKind::Ack => "ACK",
        EffectKind::Timeout => "TIMEOUT",
    }
}

/// SQLite-backed read model and checkpoint store.
pub struct SqliteStorage {
    pool: SqlitePool,
    /// Last assigned `write_seq`; held across every sequenced write.
    write: Mutex<u64>,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./ibcindex.db"`) or a full
    /// SQLite URL (`"sqlite:./ibcindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(db)?;
        Self::init(pool).await
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self> {
        // Every connection to `:memory:` is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db)?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(db)?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(db)?;
        }

        let mut last = 0u64;
        for sql in [
            "SELECT COALESCE(MAX(write_seq), 0) AS seq FROM packets",
            "SELECT COALESCE(MAX(write_seq), 0) AS seq FROM transfers",
        ] {
            let row = sqlx::query(sql).fetch_one(&pool).await.map_err(db)?;
            last = last.max(row.get::<i64, _>("seq") as u64);
        }
        debug!(write_seq = last, "sqlite storage opened");

        Ok(Self {
            pool,
            write: Mutex::new(last),
        })
    }

    async fn fetch_optional<T: DeserializeOwned>(
        &self,
        sql: &str,
        keys: &[&str],
    ) -> Result<Option<T>> {
        let mut query = sqlx::query(sql);
        for key in keys {
            query = query.bind(*key);
        }
        match query.fetch_optional(&self.pool).await.map_err(db)? {
            Some(row) => body(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn fetch_all<T: DeserializeOwned>(&self, sql: &str, keys: &[&str]) -> Result<Vec<T>> {
        let mut query = sqlx::query(sql);
        for key in keys {
            query = query.bind(*key);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db)?;
        bodies(&rows)
    }

    /// Run an upsert whose last parameter is the JSON body.
    async fn upsert(&self, sql: &str, keys: &[&str], body: String) -> Result<()> {
        let mut query = sqlx::query(sql);
        for key in keys {
            query = query.bind(*key);
        }
        query.bind(body).execute(&self.pool).await.map_err(db)?;
        Ok(())
    }

    /// Insert unless the key exists. Returns `true` if a row was written.
    async fn insert_new(&self, sql: &str, keys: &[&str], body: String) -> Result<bool> {
        let mut query = sqlx::query(sql);
        for key in keys {
            query = query.bind(*key);
        }
        let done = query.bind(body).execute(&self.pool).await.map_err(db)?;
        Ok(done.rows_affected() == 1)
    }

    async fn daily(&self, table: &str) -> Result<Vec<DailyCountRow>> {
        let rows = sqlx::query(&format!("SELECT day, count FROM {table} ORDER BY day"))
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(|r| {
                let day: String = r.get("day");
                Ok(DailyCountRow {
                    day: NaiveDate::from_str(&day)
                        .map_err(|e| IndexerError::Storage(format!("bad day {day}: {e}")))?,
                    count: r.get::<i64, _>("count") as u64,
                })
            })
            .collect()
    }
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| IndexerError::Storage(format!("bad timestamp {text}: {e}")))
}

#[async_trait]
impl ReadModelStore for SqliteStorage {
    // ─── Chains ─────────────────────────────────────────────────────────────

    async fn upsert_chain(&self, chain: ChainRow) -> Result<()> {
        self.upsert(
            "INSERT OR REPLACE INTO chains (chain_id, body) VALUES (?, ?)",
            &[&chain.chain_id],
            to_json(&chain)?,
        )
        .await
    }

    async fn get_chain(&self, chain_id: &str) -> Result<Option<ChainRow>> {
        self.fetch_optional("SELECT body FROM chains WHERE chain_id = ?", &[chain_id])
            .await
    }

    async fn list_chains(&self) -> Result<Vec<ChainRow>> {
        self.fetch_all("SELECT body FROM chains ORDER BY chain_id", &[])
            .await
    }

    // ─── Clients ────────────────────────────────────────────────────────────

    async fn upsert_client(&self, client: ClientRow) -> Result<()> {
        let k = &client.key;
        self.upsert(
            "INSERT OR REPLACE INTO clients (ibc, chain_id, client_id, body) VALUES (?, ?, ?, ?)",
            &[k.ibc.as_str(), &k.chain_id, &k.client_id],
            to_json(&client)?,
        )
        .await
    }

    async fn get_client(&self, key: &ClientKey) -> Result<Option<ClientRow>> {
        self.fetch_optional(
            "SELECT body FROM clients WHERE ibc = ? AND chain_id = ? AND client_id = ?",
            &[key.ibc.as_str(), &key.chain_id, &key.client_id],
        )
        .await
    }

    async fn list_clients(&self, chain_id: Option<&str>) -> Result<Vec<ClientRow>> {
        match chain_id {
            Some(c) => {
                self.fetch_all(
                    "SELECT body FROM clients WHERE chain_id = ? ORDER BY ibc, chain_id, client_id",
                    &[c],
                )
                .await
            }
            None => {
                self.fetch_all("SELECT body FROM clients ORDER BY ibc, chain_id, client_id", &[])
                    .await
            }
        }
    }

    async fn get_client_tip(&self, key: &ClientKey) -> Result<Option<ClientTipRow>> {
        self.fetch_optional(
            "SELECT body FROM client_tips WHERE ibc = ? AND chain_id = ? AND client_id = ?",
            &[key.ibc.as_str(), &key.chain_id, &key.client_id],
        )
        .await
    }

    async fn put_client_tip(&self, tip: ClientTipRow) -> Result<()> {
        let k = &tip.key;
        self.upsert(
            "INSERT OR REPLACE INTO client_tips (ibc, chain_id, client_id, body) VALUES (?, ?, ?, ?)",
            &[k.ibc.as_str(), &k.chain_id, &k.client_id],
            to_json(&tip)?,
        )
        .await
    }

    async fn insert_light_client_update(&self, update: LightClientUpdateRow) -> Result<bool> {
        let k = &update.key;
        let done = sqlx::query(
            "INSERT OR IGNORE INTO light_client_updates
             (ibc, chain_id, client_id, revision_number, revision_height, body)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(k.ibc.as_str())
        .bind(&k.chain_id)
        .bind(&k.client_id)
        .bind(update.height.revision_number as i64)
        .bind(update.height.revision_height as i64)
        .bind(to_json(&update)?)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(done.rows_affected() == 1)
    }

    async fn get_light_client_update(
        &self,
        key: &ClientKey,
        height: Height,
    ) -> Result<Option<LightClientUpdateRow>> {
        let row = sqlx::query(
            "SELECT body FROM light_client_updates
             WHERE ibc = ? AND chain_id = ? AND client_id = ?
               AND revision_number = ? AND revision_height = ?",
        )
        .bind(key.ibc.as_str())
        .bind(&key.chain_id)
        .bind(&key.client_id)
        .bind(height.revision_number as i64)
        .bind(height.revision_height as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(body).transpose()
    }

    async fn light_client_updates(&self, key: &ClientKey) -> Result<Vec<LightClientUpdateRow>> {
        self.fetch_all(
            "SELECT body FROM light_client_updates
             WHERE ibc = ? AND chain_id = ? AND client_id = ?
             ORDER BY revision_number, revision_height",
            &[key.ibc.as_str(), &key.chain_id, &key.client_id],
        )
        .await
    }

    // ─── Connections & channels ─────────────────────────────────────────────

    async fn get_connection(&self, key: &ConnectionKey) -> Result<Option<ConnectionRow>> {
        self.fetch_optional(
            "SELECT body FROM connections WHERE ibc = ? AND chain_id = ? AND connection_id = ?",
            &[key.ibc.as_str(), &key.chain_id, &key.connection_id],
        )
        .await
    }

    async fn put_connection(&self, row: ConnectionRow) -> Result<()> {
        let k = &row.key;
        self.upsert(
            "INSERT OR REPLACE INTO connections (ibc, chain_id, connection_id, body) VALUES (?, ?, ?, ?)",
            &[k.ibc.as_str(), &k.chain_id, &k.connection_id],
            to_json(&row)?,
        )
        .await
    }

    async fn list_connections(&self, chain_id: Option<&str>) -> Result<Vec<ConnectionRow>> {
        match chain_id {
            Some(c) => {
                self.fetch_all(
                    "SELECT body FROM connections WHERE chain_id = ? ORDER BY ibc, chain_id, connection_id",
                    &[c],
                )
                .await
            }
            None => {
                self.fetch_all(
                    "SELECT body FROM connections ORDER BY ibc, chain_id, connection_id",
                    &[],
                )
                .await
            }
        }
    }

    async fn get_channel(&self, key: &ChannelKey) -> Result<Option<ChannelRow>> {
        self.fetch_optional(
            "SELECT body FROM channels
             WHERE ibc = ? AND chain_id = ? AND port_id = ? AND channel_id = ?",
            &[key.ibc.as_str(), &key.chain_id, &key.port_id, &key.channel_id],
        )
        .await
    }

    async fn put_channel(&self, row: ChannelRow) -> Result<()> {
        let k = &row.key;
        self.upsert(
            "INSERT OR REPLACE INTO channels (ibc, chain_id, port_id, channel_id, body)
             VALUES (?, ?, ?, ?, ?)",
            &[k.ibc.as_str(), &k.chain_id, &k.port_id, &k.channel_id],
            to_json(&row)?,
        )
        .await
    }

    async fn find_channel(
        &self,
        ibc: IbcVersion,
        chain_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelRow>> {
        self.fetch_optional(
            "SELECT body FROM channels WHERE ibc = ? AND chain_id = ? AND channel_id = ?
             ORDER BY port_id LIMIT 1",
            &[ibc.as_str(), chain_id, channel_id],
        )
        .await
    }

    async fn list_channels(&self, chain_id: Option<&str>) -> Result<Vec<ChannelRow>> {
        match chain_id {
            Some(c) => {
                self.fetch_all(
                    "SELECT body FROM channels WHERE chain_id = ?
                     ORDER BY ibc, chain_id, port_id, channel_id",
                    &[c],
                )
                .await
            }
            None => {
                self.fetch_all(
                    "SELECT body FROM channels ORDER BY ibc, chain_id, port_id, channel_id",
                    &[],
                )
                .await
            }
        }
    }

    async fn insert_handshake_event(&self, row: HandshakeEventRow) -> Result<bool> {
        let entity = row.entity.to_string();
        self.insert_new(
            "INSERT OR IGNORE INTO handshake_events (entity, step, body) VALUES (?, ?, ?)",
            &[&entity, row.step.as_str()],
            to_json(&row)?,
        )
        .await
    }

    async fn has_handshake_event(
        &self,
        entity: &HandshakeEntity,
        step: HandshakeStep,
    ) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS found FROM handshake_events WHERE entity = ? AND step = ?")
            .bind(entity.to_string())
            .bind(step.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.is_some())
    }

    async fn handshake_events(&self, entity: &HandshakeEntity) -> Result<Vec<HandshakeEventRow>> {
        let entity = entity.to_string();
        let mut rows: Vec<HandshakeEventRow> = self
            .fetch_all("SELECT body FROM handshake_events WHERE entity = ?", &[&entity])
            .await?;
        rows.sort_by_key(|r| r.step);
        Ok(rows)
    }

    // ─── Packets ────────────────────────────────────────────────────────────

    async fn get_packet(&self, key: &PacketKey) -> Result<Option<PacketRow>> {
        let row = sqlx::query(
            "SELECT body FROM packets
             WHERE ibc = ? AND source_chain_id = ? AND source_channel_id = ?
               AND source_port_id = ? AND sequence = ?",
        )
        .bind(key.ibc.as_str())
        .bind(&key.source_chain_id)
        .bind(&key.source_channel_id)
        .bind(&key.source_port_id)
        .bind(key.sequence as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(body).transpose()
    }

    async fn put_packet(
        &self,
        mut row: PacketRow,
        expected_revision: Option<u64>,
    ) -> Result<PacketRow> {
        let mut last = self.write.lock().await;
        let seq = *last + 1;
        let k = row.key.clone();
        let conflict = |found: Option<u64>| IndexerError::Conflict {
            entity: format!("packet {k}"),
            expected: expected_revision,
            found,
        };

        match expected_revision {
            None => {
                row.revision = 1;
                row.write_seq = seq;
                row.created_seq = seq;
                let done = sqlx::query(
                    "INSERT OR IGNORE INTO packets
                     (ibc, source_chain_id, source_channel_id, source_port_id, sequence,
                      status, revision, write_seq, created_seq, body)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(k.ibc.as_str())
                .bind(&k.source_chain_id)
                .bind(&k.source_channel_id)
                .bind(&k.source_port_id)
                .bind(k.sequence as i64)
                .bind(row.status.as_str())
                .bind(row.revision as i64)
                .bind(seq as i64)
                .bind(seq as i64)
                .bind(to_json(&row)?)
                .execute(&self.pool)
                .await
                .map_err(db)?;
                if done.rows_affected() != 1 {
                    let found = self.get_packet(&k).await?.map(|p| p.revision);
                    return Err(conflict(found));
                }
            }
            Some(expected) => {
                let current = self.get_packet(&k).await?;
                let Some(current) = current else {
                    return Err(conflict(None));
                };
                row.revision = expected + 1;
                row.write_seq = seq;
                row.created_seq = current.created_seq;
                let done = sqlx::query(
                    "UPDATE packets SET status = ?, revision = ?, write_seq = ?, body = ?
                     WHERE ibc = ? AND source_chain_id = ? AND source_channel_id = ?
                       AND source_port_id = ? AND sequence = ? AND revision = ?",
                )
                .bind(row.status.as_str())
                .bind(row.revision as i64)
                .bind(seq as i64)
                .bind(to_json(&row)?)
                .bind(k.ibc.as_str())
                .bind(&k.source_chain_id)
                .bind(&k.source_channel_id)
                .bind(&k.source_port_id)
                .bind(k.sequence as i64)
                .bind(expected as i64)
                .execute(&self.pool)
                .await
                .map_err(db)?;
                if done.rows_affected() != 1 {
                    return Err(conflict(Some(current.revision)));
                }
            }
        }
        *last = seq;
        Ok(row)
    }

    async fn list_packets(&self) -> Result<Vec<PacketRow>> {
        self.fetch_all(
            "SELECT body FROM packets
             ORDER BY ibc, source_chain_id, source_channel_id, source_port_id, sequence",
            &[],
        )
        .await
    }

    async fn packets_created_since(&self, created_seq: u64) -> Result<Vec<PacketRow>> {
        let rows = sqlx::query("SELECT body FROM packets WHERE created_seq > ? ORDER BY created_seq")
            .bind(created_seq as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        bodies(&rows)
    }

    async fn packet_status_counts(&self, created_up_to: u64) -> Result<StatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM packets WHERE created_seq <= ? GROUP BY status",
        )
        .bind(created_up_to.min(i64::MAX as u64) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let status = PacketStatus::from_str(&row.get::<String, _>("status"))?;
            let n = row.get::<i64, _>("n") as u64;
            match status {
                PacketStatus::Sent => counts.sent = n,
                PacketStatus::Received => counts.received = n,
                PacketStatus::Acknowledged => counts.acknowledged = n,
                PacketStatus::TimedOut => counts.timed_out = n,
            }
        }
        Ok(counts)
    }

    async fn last_write_seq(&self) -> Result<u64> {
        Ok(*self.write.lock().await)
    }

    async fn insert_packet_effect(&self, effect: PacketEffectRow) -> Result<bool> {
        let packet_key = effect.key.to_string();
        let event_id = effect.event.event_id();
        self.insert_new(
            "INSERT OR IGNORE INTO packet_effects (packet_key, event_id, kind, chain_id, body)
             VALUES (?, ?, ?, ?, ?)",
            &[
                &packet_key,
                &event_id,
                effect_kind(effect.kind),
                &effect.event.chain_id,
            ],
            to_json(&effect)?,
        )
        .await
    }

    async fn packet_effects(&self, key: &PacketKey) -> Result<Vec<PacketEffectRow>> {
        let packet_key = key.to_string();
        let mut rows: Vec<PacketEffectRow> = self
            .fetch_all("SELECT body FROM packet_effects WHERE packet_key = ?", &[&packet_key])
            .await?;
        rows.sort_by_key(effect_order);
        Ok(rows)
    }

    async fn acknowledge_events(&self, chain_id: Option<&str>) -> Result<Vec<PacketEffectRow>> {
        let mut rows: Vec<PacketEffectRow> = match chain_id {
            Some(c) => {
                self.fetch_all(
                    "SELECT body FROM packet_effects WHERE kind = 'ACK' AND chain_id = ?",
                    &[c],
                )
                .await?
            }
            None => {
                self.fetch_all("SELECT body FROM packet_effects WHERE kind = 'ACK'", &[])
                    .await?
            }
        };
        rows.sort_by(|a, b| {
            (&a.event.chain_id, a.event.height, a.event.event_index)
                .cmp(&(&b.event.chain_id, b.event.height, b.event.event_index))
        });
        Ok(rows)
    }

    // ─── Transfers & orders ─────────────────────────────────────────────────

    async fn put_transfer(&self, mut row: TransferRow) -> Result<TransferRow> {
        let mut last = self.write.lock().await;
        let seq = *last + 1;
        let packet_key = row.key.to_string();
        let existing = sqlx::query("SELECT created_seq FROM transfers WHERE packet_key = ?")
            .bind(&packet_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.write_seq = seq;
        row.created_seq = existing
            .map(|r| r.get::<i64, _>("created_seq") as u64)
            .unwrap_or(seq);

        sqlx::query(
            "INSERT OR REPLACE INTO transfers (packet_key, root_key, write_seq, created_seq, body)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&packet_key)
        .bind(row.hop.as_ref().map(|h| h.root.to_string()))
        .bind(seq as i64)
        .bind(row.created_seq as i64)
        .bind(to_json(&row)?)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        *last = seq;
        Ok(row)
    }

    async fn get_transfer(&self, key: &PacketKey) -> Result<Option<TransferRow>> {
        let packet_key = key.to_string();
        self.fetch_optional("SELECT body FROM transfers WHERE packet_key = ?", &[&packet_key])
            .await
    }

    async fn list_transfers(&self) -> Result<Vec<TransferRow>> {
        let mut rows: Vec<TransferRow> = self.fetch_all("SELECT body FROM transfers", &[]).await?;
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    async fn transfers_created_since(&self, created_seq: u64) -> Result<Vec<TransferRow>> {
        let rows =
            sqlx::query("SELECT body FROM transfers WHERE created_seq > ? ORDER BY created_seq")
                .bind(created_seq as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(db)?;
        bodies(&rows)
    }

    async fn forwards(&self, root: &PacketKey) -> Result<Vec<TransferRow>> {
        let root_key = root.to_string();
        let mut rows: Vec<TransferRow> = self
            .fetch_all("SELECT body FROM transfers WHERE root_key = ?", &[&root_key])
            .await?;
        rows.sort_by_key(|r| r.hop.as_ref().map(|h| (h.hop_index, h.retries)));
        Ok(rows)
    }

    async fn put_fungible_asset_order(&self, row: FungibleAssetOrderRow) -> Result<()> {
        let packet_key = row.key.to_string();
        self.upsert(
            "INSERT OR REPLACE INTO fungible_asset_orders (packet_key, body) VALUES (?, ?)",
            &[&packet_key],
            to_json(&row)?,
        )
        .await
    }

    async fn get_fungible_asset_order(
        &self,
        key: &PacketKey,
    ) -> Result<Option<FungibleAssetOrderRow>> {
        let packet_key = key.to_string();
        self.fetch_optional(
            "SELECT body FROM fungible_asset_orders WHERE packet_key = ?",
            &[&packet_key],
        )
        .await
    }

    async fn list_fungible_asset_orders(&self) -> Result<Vec<FungibleAssetOrderRow>> {
        let mut rows: Vec<FungibleAssetOrderRow> = self
            .fetch_all("SELECT body FROM fungible_asset_orders", &[])
            .await?;
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    // ─── Block times ────────────────────────────────────────────────────────

    async fn put_block_time(&self, chain_id: &str, height: u64, time: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO block_times (chain_id, height, time) VALUES (?, ?, ?)")
            .bind(chain_id)
            .bind(height as i64)
            .bind(time.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn block_time(&self, chain_id: &str, height: u64) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT time FROM block_times WHERE chain_id = ? AND height = ?")
            .bind(chain_id)
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.map(|r| parse_time(&r.get::<String, _>("time"))).transpose()
    }

    // ─── Statistics ─────────────────────────────────────────────────────────

    async fn replace_statistics(&self, snapshot: StatsSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        for table in ["daily_packets", "daily_transfers", "statistics_address", "statistics"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }
        for (table, rows) in [
            ("daily_packets", &snapshot.daily_packets),
            ("daily_transfers", &snapshot.daily_transfers),
        ] {
            let sql = format!("INSERT INTO {table} (day, count) VALUES (?, ?)");
            for r in rows {
                sqlx::query(&sql)
                    .bind(r.day.to_string())
                    .bind(r.count as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
            }
        }
        for a in &snapshot.addresses {
            sqlx::query(
                "INSERT INTO statistics_address
                 (address, transfers_sent, transfers_received, first_seen, last_seen)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&a.address)
            .bind(a.transfers_sent as i64)
            .bind(a.transfers_received as i64)
            .bind(a.first_seen.to_rfc3339())
            .bind(a.last_seen.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        sqlx::query("INSERT INTO statistics (id, body, watermark) VALUES (1, ?, ?)")
            .bind(to_json(&snapshot.statistics)?)
            .bind(snapshot.watermark as i64)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn statistics(&self) -> Result<StatsSnapshot> {
        let totals = sqlx::query("SELECT body, watermark FROM statistics WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        let (statistics, watermark) = match totals {
            Some(row) => (
                body::<StatisticsRow>(&row)?,
                row.get::<i64, _>("watermark") as u64,
            ),
            None => (StatisticsRow::default(), 0),
        };

        let rows = sqlx::query(
            "SELECT address, transfers_sent, transfers_received, first_seen, last_seen
             FROM statistics_address ORDER BY address",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        let mut addresses = Vec::with_capacity(rows.len());
        for r in rows {
            addresses.push(StatisticsAddressRow {
                address: r.get("address"),
                transfers_sent: r.get::<i64, _>("transfers_sent") as u64,
                transfers_received: r.get::<i64, _>("transfers_received") as u64,
                first_seen: parse_time(&r.get::<String, _>("first_seen"))?,
                last_seen: parse_time(&r.get::<String, _>("last_seen"))?,
            });
        }

        Ok(StatsSnapshot {
            daily_packets: self.daily("daily_packets").await?,
            daily_transfers: self.daily("daily_transfers").await?,
            statistics,
            addresses,
            watermark,
        })
    }

    // ─── Index status & anomalies ───────────────────────────────────────────

    async fn put_index_status(&self, row: IndexStatusRow) -> Result<()> {
        self.upsert(
            "INSERT OR REPLACE INTO index_status (chain_id, body) VALUES (?, ?)",
            &[&row.chain_id],
            to_json(&row)?,
        )
        .await
    }

    async fn get_index_status(&self, chain_id: &str) -> Result<Option<IndexStatusRow>> {
        self.fetch_optional("SELECT body FROM index_status WHERE chain_id = ?", &[chain_id])
            .await
    }

    async fn list_index_status(&self) -> Result<Vec<IndexStatusRow>> {
        self.fetch_all("SELECT body FROM index_status ORDER BY chain_id", &[])
            .await
    }

    async fn insert_anomaly(&self, anomaly: Anomaly) -> Result<bool> {
        let done = sqlx::query("INSERT OR IGNORE INTO anomalies (id, observed_us, body) VALUES (?, ?, ?)")
            .bind(&anomaly.id)
            .bind(anomaly.observed_at.timestamp_micros())
            .bind(to_json(&anomaly)?)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(done.rows_affected() == 1)
    }

    async fn list_anomalies(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Anomaly>> {
        let since = since.map_or(i64::MIN, |s| s.timestamp_micros());
        let rows = sqlx::query(
            "SELECT body FROM anomalies WHERE observed_us >= ? ORDER BY observed_us, id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        bodies(&rows)
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(
        &self,
        chain_id: &str,
        indexer_id: &str,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT chain_id, indexer_id, height, block_hash, updated_at
             FROM checkpoints WHERE chain_id = ? AND indexer_id = ?",
        )
        .bind(chain_id)
        .bind(indexer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        Ok(row.map(|r| Checkpoint {
            chain_id: r.get("chain_id"),
            indexer_id: r.get("indexer_id"),
            height: r.get::<i64, _>("height") as u64,
            block_hash: r.get("block_hash"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints
             (chain_id, indexer_id, height, block_hash, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.chain_id)
        .bind(&checkpoint.indexer_id)
        .bind(checkpoint.height as i64)
        .bind(&checkpoint.block_hash)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        debug!(
            chain_id = %checkpoint.chain_id,
            indexer_id = %checkpoint.indexer_id,
            height = checkpoint.height,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, chain_id: &str, indexer_id: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE chain_id = ? AND indexer_id = ?")
            .bind(chain_id)
            .bind(indexer_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
