use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Bytes, H256, U256};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::{BundleStore, BundleUpdate, UserOpStore, UserOpUpdate};
use crate::common::types::{BundleRecord, UserOpRecord, UserOperation};

/// PostgreSQL implementation of the durable stores. 256-bit quantities are
/// stored as decimal text, addresses and hashes as 0x-prefixed hex text.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url)
            .await
            .context("should connect to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("running migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("migrations complete");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("postgres ping failed")?;
        Ok(())
    }
}

#[derive(sqlx::FromRow, Debug)]
struct UserOpRow {
    hash: String,
    sender: String,
    nonce: String,
    init_code: String,
    call_data: String,
    call_gas_limit: String,
    verification_gas_limit: String,
    pre_verification_gas: String,
    max_fee_per_gas: String,
    max_priority_fee_per_gas: String,
    paymaster_and_data: String,
    signature: String,
    status: String,
    bundle_id: Option<Uuid>,
    transaction_hash: Option<String>,
    block_number: Option<i64>,
    error: Option<String>,
    submitted_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Debug)]
struct BundleRow {
    id: Uuid,
    status: String,
    transaction_hash: Option<String>,
    block_number: Option<i64>,
    error: Option<String>,
    submitted_at: DateTime<Utc>,
}

fn h256_to_text(hash: H256) -> String {
    format!("{hash:?}")
}

fn u256_to_text(value: U256) -> String {
    value.to_string()
}

fn u256_from_text(text: &str) -> Result<U256> {
    U256::from_dec_str(text).with_context(|| format!("invalid stored uint: {text}"))
}

fn bytes_from_text(text: &str) -> Result<Bytes> {
    text.parse()
        .map_err(|_| anyhow!("invalid stored bytes: {text}"))
}

impl TryFrom<UserOpRow> for UserOpRecord {
    type Error = anyhow::Error;

    fn try_from(row: UserOpRow) -> Result<Self> {
        let op = UserOperation {
            sender: row.sender.parse().context("invalid stored sender")?,
            nonce: u256_from_text(&row.nonce)?,
            init_code: bytes_from_text(&row.init_code)?,
            call_data: bytes_from_text(&row.call_data)?,
            call_gas_limit: u256_from_text(&row.call_gas_limit)?,
            verification_gas_limit: u256_from_text(&row.verification_gas_limit)?,
            pre_verification_gas: u256_from_text(&row.pre_verification_gas)?,
            max_fee_per_gas: u256_from_text(&row.max_fee_per_gas)?,
            max_priority_fee_per_gas: u256_from_text(&row.max_priority_fee_per_gas)?,
            paymaster_and_data: bytes_from_text(&row.paymaster_and_data)?,
            signature: bytes_from_text(&row.signature)?,
        };
        Ok(UserOpRecord {
            op,
            hash: row.hash.parse().context("invalid stored hash")?,
            status: row.status.parse().context("invalid stored status")?,
            bundle_id: row.bundle_id,
            transaction_hash: row
                .transaction_hash
                .map(|hash| hash.parse().context("invalid stored tx hash"))
                .transpose()?,
            block_number: row.block_number.map(|n| n as u64),
            error: row.error,
            submitted_at: row.submitted_at,
        })
    }
}

impl TryFrom<BundleRow> for BundleRecord {
    type Error = anyhow::Error;

    fn try_from(row: BundleRow) -> Result<Self> {
        Ok(BundleRecord {
            id: row.id,
            status: row.status.parse().context("invalid stored status")?,
            transaction_hash: row
                .transaction_hash
                .map(|hash| hash.parse().context("invalid stored tx hash"))
                .transpose()?,
            block_number: row.block_number.map(|n| n as u64),
            error: row.error,
            submitted_at: row.submitted_at,
        })
    }
}

const USER_OP_COLUMNS: &str = "hash, sender, nonce, init_code, call_data, call_gas_limit, \
     verification_gas_limit, pre_verification_gas, max_fee_per_gas, max_priority_fee_per_gas, \
     paymaster_and_data, signature, status, bundle_id, transaction_hash, block_number, error, \
     submitted_at";

#[async_trait]
impl UserOpStore for PostgresStore {
    async fn insert(&self, record: &UserOpRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_operations (
                id, hash, sender, nonce, init_code, call_data, call_gas_limit,
                verification_gas_limit, pre_verification_gas, max_fee_per_gas,
                max_priority_fee_per_gas, paymaster_and_data, signature, status,
                submitted_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(h256_to_text(record.hash))
        .bind(format!("{:?}", record.op.sender))
        .bind(u256_to_text(record.op.nonce))
        .bind(record.op.init_code.to_string())
        .bind(record.op.call_data.to_string())
        .bind(u256_to_text(record.op.call_gas_limit))
        .bind(u256_to_text(record.op.verification_gas_limit))
        .bind(u256_to_text(record.op.pre_verification_gas))
        .bind(u256_to_text(record.op.max_fee_per_gas))
        .bind(u256_to_text(record.op.max_priority_fee_per_gas))
        .bind(record.op.paymaster_and_data.to_string())
        .bind(record.op.signature.to_string())
        .bind(record.status.to_string())
        .bind(record.submitted_at)
        .execute(&self.pool)
        .await
        .context("should insert user operation")?;
        Ok(())
    }

    async fn get_by_hash(&self, hash: H256) -> Result<Option<UserOpRecord>> {
        let row = sqlx::query_as::<_, UserOpRow>(&format!(
            "SELECT {USER_OP_COLUMNS} FROM user_operations WHERE hash = $1"
        ))
        .bind(h256_to_text(hash))
        .fetch_optional(&self.pool)
        .await
        .context("should query user operation by hash")?;
        row.map(UserOpRecord::try_from).transpose()
    }

    async fn get_by_hashes(&self, hashes: &[H256]) -> Result<Vec<UserOpRecord>> {
        let hashes: Vec<String> = hashes.iter().copied().map(h256_to_text).collect();
        let rows = sqlx::query_as::<_, UserOpRow>(&format!(
            "SELECT {USER_OP_COLUMNS} FROM user_operations WHERE hash = ANY($1)"
        ))
        .bind(&hashes)
        .fetch_all(&self.pool)
        .await
        .context("should query user operations by hashes")?;
        rows.into_iter().map(UserOpRecord::try_from).collect()
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<UserOpRecord>> {
        let rows = sqlx::query_as::<_, UserOpRow>(&format!(
            "SELECT {USER_OP_COLUMNS} FROM user_operations \
             WHERE status = 'pending' ORDER BY submitted_at ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("should list pending user operations")?;
        rows.into_iter().map(UserOpRecord::try_from).collect()
    }

    async fn update_by_hashes(&self, hashes: &[H256], update: UserOpUpdate) -> Result<u64> {
        let hashes: Vec<String> = hashes.iter().copied().map(h256_to_text).collect();
        let result = sqlx::query(
            r#"
            UPDATE user_operations SET
                status = COALESCE($1, status),
                bundle_id = COALESCE($2, bundle_id),
                transaction_hash = COALESCE($3, transaction_hash),
                block_number = COALESCE($4, block_number),
                error = COALESCE($5, error),
                updated_at = NOW()
            WHERE hash = ANY($6)
            "#,
        )
        .bind(update.status.map(|status| status.to_string()))
        .bind(update.bundle_id)
        .bind(update.transaction_hash.map(h256_to_text))
        .bind(update.block_number.map(|n| n as i64))
        .bind(update.error)
        .bind(&hashes)
        .execute(&self.pool)
        .await
        .context("should update user operations")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BundleStore for PostgresStore {
    async fn insert(&self, record: &BundleRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bundles (id, status, submitted_at, updated_at)
            VALUES ($1, $2, $3, $3)
            "#,
        )
        .bind(record.id)
        .bind(record.status.to_string())
        .bind(record.submitted_at)
        .execute(&self.pool)
        .await
        .context("should insert bundle")?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BundleRecord>> {
        let row = sqlx::query_as::<_, BundleRow>(
            "SELECT id, status, transaction_hash, block_number, error, submitted_at \
             FROM bundles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("should query bundle")?;
        row.map(BundleRecord::try_from).transpose()
    }

    async fn update(&self, id: Uuid, update: BundleUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE bundles SET
                status = COALESCE($1, status),
                transaction_hash = COALESCE($2, transaction_hash),
                block_number = COALESCE($3, block_number),
                error = COALESCE($4, error),
                updated_at = NOW()
            WHERE id = $5
            "#,
        )
        .bind(update.status.map(|status| status.to_string()))
        .bind(update.transaction_hash.map(h256_to_text))
        .bind(update.block_number.map(|n| n as i64))
        .bind(update.error)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("should update bundle")?;
        Ok(())
    }
}
