use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{DeviceClass, DeviceKey, DeviceState, Level};

/// Append-only SQLite store behind the development ledger.
#[derive(Clone)]
pub struct LedgerStore {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Reverted,
}

impl TransactionStatus {
    fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Reverted => "reverted",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(TransactionStatus::Pending),
            "confirmed" => Ok(TransactionStatus::Confirmed),
            "reverted" => Ok(TransactionStatus::Reverted),
            other => Err(anyhow!("unknown transaction status '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredDevice {
    pub key: DeviceKey,
    pub state: Option<DeviceState>,
    pub updated_block: u64,
    pub faulted: bool,
}

#[derive(Debug, Clone)]
pub struct StoredTransaction {
    pub nonce: u64,
    pub tx_ref: String,
    pub signer: String,
    pub device: DeviceKey,
    pub requested_state: DeviceState,
    pub status: TransactionStatus,
    pub block_ordinal: Option<u64>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    pub ordinal: u64,
    pub confirmed: Vec<String>,
    pub reverted: Vec<String>,
}

impl LedgerStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every in-memory connection is its own database.
        let max_connections = if is_memory_url(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn register_device(&self, key: DeviceKey) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices (device_class, device_id) VALUES (?, ?)
             ON CONFLICT(device_class, device_id) DO NOTHING",
        )
        .bind(key.device_class.as_str())
        .bind(i64::from(key.device_id.0))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to register device {key}"))?;
        Ok(())
    }

    pub async fn device(&self, key: DeviceKey) -> Result<Option<StoredDevice>> {
        let row = sqlx::query(
            "SELECT device_class, device_id, is_on, level, updated_block, faulted
             FROM devices WHERE device_class = ? AND device_id = ?",
        )
        .bind(key.device_class.as_str())
        .bind(i64::from(key.device_id.0))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(device_from_row).transpose()
    }

    pub async fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        let rows = sqlx::query(
            "SELECT device_class, device_id, is_on, level, updated_block, faulted
             FROM devices ORDER BY device_class, device_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(device_from_row).collect()
    }

    /// Returns false when the device is not registered.
    pub async fn set_faulted(&self, key: DeviceKey, faulted: bool) -> Result<bool> {
        let result =
            sqlx::query("UPDATE devices SET faulted = ? WHERE device_class = ? AND device_id = ?")
                .bind(faulted)
                .bind(key.device_class.as_str())
                .bind(i64::from(key.device_id.0))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn append_transaction(
        &self,
        signer: &str,
        device: DeviceKey,
        requested_state: DeviceState,
    ) -> Result<StoredTransaction> {
        let mut tx = self.pool.begin().await?;
        let nonce: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(nonce), 0) + 1 FROM transactions")
            .fetch_one(&mut *tx)
            .await?;
        let tx_ref = derive_tx_ref(signer, nonce as u64, device, requested_state);

        let row = sqlx::query(
            "INSERT INTO transactions (nonce, tx_ref, signer, device_class, device_id, is_on, level)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING nonce, tx_ref, signer, device_class, device_id, is_on, level,
                       status, block_ordinal, reason, created_at",
        )
        .bind(nonce)
        .bind(&tx_ref)
        .bind(signer)
        .bind(device.device_class.as_str())
        .bind(i64::from(device.device_id.0))
        .bind(requested_state.on)
        .bind(i64::from(requested_state.level.get()))
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to append transaction for {device}"))?;
        tx.commit().await?;

        transaction_from_row(&row)
    }

    pub async fn transaction(&self, tx_ref: &str) -> Result<Option<StoredTransaction>> {
        let row = sqlx::query(
            "SELECT nonce, tx_ref, signer, device_class, device_id, is_on, level,
                    status, block_ordinal, reason, created_at
             FROM transactions WHERE tx_ref = ?",
        )
        .bind(tx_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    pub async fn list_transactions(&self, limit: u32) -> Result<Vec<StoredTransaction>> {
        let rows = sqlx::query(
            "SELECT nonce, tx_ref, signer, device_class, device_id, is_on, level,
                    status, block_ordinal, reason, created_at
             FROM transactions ORDER BY nonce DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    pub async fn pending_transactions(&self) -> Result<Vec<StoredTransaction>> {
        let rows = sqlx::query(
            "SELECT nonce, tx_ref, signer, device_class, device_id, is_on, level,
                    status, block_ordinal, reason, created_at
             FROM transactions WHERE status = 'pending' ORDER BY nonce ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    pub async fn head_block(&self) -> Result<u64> {
        let head: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(ordinal), 0) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        Ok(head as u64)
    }

    /// Applies every pending transaction in nonce order under one new block
    /// ordinal. Transactions against faulted or unregistered devices revert.
    /// Returns `None` when nothing was pending.
    pub async fn seal_block(&self) -> Result<Option<SealedBlock>> {
        let mut tx = self.pool.begin().await?;

        let pending = sqlx::query(
            "SELECT nonce, tx_ref, signer, device_class, device_id, is_on, level,
                    status, block_ordinal, reason, created_at
             FROM transactions WHERE status = 'pending' ORDER BY nonce ASC",
        )
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(transaction_from_row)
        .collect::<Result<Vec<_>>>()?;

        if pending.is_empty() {
            return Ok(None);
        }

        let ordinal: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(ordinal), 0) + 1 FROM blocks")
            .fetch_one(&mut *tx)
            .await?;

        let mut sealed = SealedBlock {
            ordinal: ordinal as u64,
            confirmed: Vec::new(),
            reverted: Vec::new(),
        };

        for pending_tx in pending {
            let device = pending_tx.device;
            let faulted: Option<bool> = sqlx::query_scalar(
                "SELECT faulted FROM devices WHERE device_class = ? AND device_id = ?",
            )
            .bind(device.device_class.as_str())
            .bind(i64::from(device.device_id.0))
            .fetch_optional(&mut *tx)
            .await?;

            let revert_reason = match faulted {
                None => Some(format!("device {device} is not registered")),
                Some(true) => Some(format!("device {device} is faulted")),
                Some(false) => None,
            };

            match revert_reason {
                Some(reason) => {
                    sqlx::query(
                        "UPDATE transactions SET status = ?, block_ordinal = ?, reason = ?
                         WHERE nonce = ?",
                    )
                    .bind(TransactionStatus::Reverted.as_str())
                    .bind(ordinal)
                    .bind(reason)
                    .bind(pending_tx.nonce as i64)
                    .execute(&mut *tx)
                    .await?;
                    sealed.reverted.push(pending_tx.tx_ref);
                }
                None => {
                    sqlx::query(
                        "UPDATE devices SET is_on = ?, level = ?, updated_block = ?
                         WHERE device_class = ? AND device_id = ?",
                    )
                    .bind(pending_tx.requested_state.on)
                    .bind(i64::from(pending_tx.requested_state.level.get()))
                    .bind(ordinal)
                    .bind(device.device_class.as_str())
                    .bind(i64::from(device.device_id.0))
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query(
                        "UPDATE transactions SET status = ?, block_ordinal = ? WHERE nonce = ?",
                    )
                    .bind(TransactionStatus::Confirmed.as_str())
                    .bind(ordinal)
                    .bind(pending_tx.nonce as i64)
                    .execute(&mut *tx)
                    .await?;
                    sealed.confirmed.push(pending_tx.tx_ref);
                }
            }
        }

        sqlx::query("INSERT INTO blocks (ordinal, tx_count) VALUES (?, ?)")
            .bind(ordinal)
            .bind((sealed.confirmed.len() + sealed.reverted.len()) as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(sealed))
    }
}

fn derive_tx_ref(signer: &str, nonce: u64, device: DeviceKey, state: DeviceState) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signer.as_bytes());
    hasher.update(nonce.to_be_bytes());
    hasher.update(device.to_string().as_bytes());
    hasher.update([u8::from(state.on), state.level.get()]);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn device_key_from_row(row: &SqliteRow) -> Result<DeviceKey> {
    let class: String = row.try_get("device_class")?;
    let device_id: i64 = row.try_get("device_id")?;
    let device_class = DeviceClass::from_str(&class)?;
    let device_id = u32::try_from(device_id)
        .with_context(|| format!("device id {device_id} does not fit a u32"))?;
    Ok(DeviceKey::new(device_class, device_id))
}

fn state_from_columns(is_on: bool, level: i64) -> Result<DeviceState> {
    Ok(DeviceState {
        on: is_on,
        level: Level::new(level)?,
    })
}

fn device_from_row(row: &SqliteRow) -> Result<StoredDevice> {
    let is_on: Option<bool> = row.try_get("is_on")?;
    let level: Option<i64> = row.try_get("level")?;
    let state = match (is_on, level) {
        (Some(is_on), Some(level)) => Some(state_from_columns(is_on, level)?),
        _ => None,
    };
    let updated_block: i64 = row.try_get("updated_block")?;
    Ok(StoredDevice {
        key: device_key_from_row(row)?,
        state,
        updated_block: updated_block as u64,
        faulted: row.try_get("faulted")?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<StoredTransaction> {
    let nonce: i64 = row.try_get("nonce")?;
    let status: String = row.try_get("status")?;
    let block_ordinal: Option<i64> = row.try_get("block_ordinal")?;
    Ok(StoredTransaction {
        nonce: nonce as u64,
        tx_ref: row.try_get("tx_ref")?,
        signer: row.try_get("signer")?,
        device: device_key_from_row(row)?,
        requested_state: state_from_columns(row.try_get("is_on")?, row.try_get("level")?)?,
        status: TransactionStatus::parse(&status)?,
        block_ordinal: block_ordinal.map(|ordinal| ordinal as u64),
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
