//! SQLite-backed [`PendingStore`] for both record kinds.

use crate::records::{Authorization, Registration, RecordStatus, SubmissionState};
use crate::store::{PendingStore, StoreError};
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use eyre::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row};
use std::str::FromStr;

pub type Db = sqlx::SqlitePool;

pub struct SqlStore {
    db: Db,
}

impl SqlStore {
    /// Open (creating if missing) and migrate the database at `database_url`
    pub async fn connect(database_url: &str) -> eyre::Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .context("while parsing database url")?
            .create_if_missing(true)
            .disable_statement_logging();

        // One writer: the engine is sequential, and in-memory databases are per connection
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .context("while connecting to database")?;

        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .context("while migrating database")?;

        Ok(SqlStore { db })
    }

    pub async fn insert_authorization(
        &self,
        election_id: u64,
        voter_address: Address,
    ) -> eyre::Result<i64> {
        let result =
            sqlx::query("INSERT INTO authorizations (election_id, voter_address) VALUES (?, ?)")
                .bind(i64::try_from(election_id)?)
                .bind(voter_address.to_string())
                .execute(&self.db)
                .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_registration(
        &self,
        election_id: u64,
        voter_address: Address,
        blinded_token: &blindvote::Token,
        blind_signature: &blindvote::Signature,
    ) -> eyre::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO registrations (election_id, voter_address, blinded_token, blind_signature) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(i64::try_from(election_id)?)
        .bind(voter_address.to_string())
        .bind(blinded_token.to_hex())
        .bind(blind_signature.to_hex())
        .execute(&self.db)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update(
        &self,
        table: &'static str,
        id: i64,
        status: RecordStatus,
        tx_hash: Option<B256>,
        batch_id: Option<&str>,
    ) -> eyre::Result<()> {
        let mut tx = self.db.begin().await?;

        let row = sqlx::query(&format!("SELECT status FROM {table} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let from = RecordStatus::try_from(row.try_get::<u8, _>("status")?)?;

        if !from.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from,
                to: status,
            }
            .into());
        }

        sqlx::query(&format!(
            "UPDATE {table} SET status = ?, tx_hash = COALESCE(?, tx_hash), \
             batch_id = COALESCE(?, batch_id) WHERE id = ?"
        ))
        .bind(u8::from(status))
        .bind(tx_hash.map(|h| h.to_string()))
        .bind(batch_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn submission_state(row: &SqliteRow) -> eyre::Result<SubmissionState> {
    let status = RecordStatus::try_from(row.try_get::<u8, _>("status")?)?;
    let tx_hash = row
        .try_get::<Option<String>, _>("tx_hash")?
        .map(|h| B256::from_str(&h))
        .transpose()?;
    Ok(SubmissionState {
        status,
        tx_hash,
        batch_id: row.try_get("batch_id")?,
    })
}

fn election_id(row: &SqliteRow) -> eyre::Result<u64> {
    Ok(u64::try_from(row.try_get::<i64, _>("election_id")?)?)
}

fn voter_address(row: &SqliteRow) -> eyre::Result<Address> {
    Ok(blindvote::parse_address(&row.try_get::<String, _>("voter_address")?)?)
}

#[async_trait]
impl PendingStore<Authorization> for SqlStore {
    async fn get_pending(&self) -> eyre::Result<Vec<Authorization>> {
        let rows = sqlx::query(
            "SELECT id, election_id, voter_address, status, tx_hash, batch_id \
             FROM authorizations WHERE status = ? ORDER BY id",
        )
        .bind(u8::from(RecordStatus::Pending))
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Authorization {
                    id: row.try_get("id")?,
                    election_id: election_id(row)?,
                    voter_address: voter_address(row)?,
                    state: submission_state(row)?,
                })
            })
            .collect()
    }

    async fn update_status(
        &self,
        id: i64,
        status: RecordStatus,
        tx_hash: Option<B256>,
        batch_id: Option<&str>,
    ) -> eyre::Result<()> {
        self.update("authorizations", id, status, tx_hash, batch_id)
            .await
    }
}

#[async_trait]
impl PendingStore<Registration> for SqlStore {
    async fn get_pending(&self) -> eyre::Result<Vec<Registration>> {
        let rows = sqlx::query(
            "SELECT id, election_id, voter_address, blinded_token, blind_signature, status, \
             tx_hash, batch_id FROM registrations WHERE status = ? ORDER BY id",
        )
        .bind(u8::from(RecordStatus::Pending))
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                let blinded_token: blindvote::Token = row
                    .try_get::<String, _>("blinded_token")?
                    .parse()
                    .with_context(|| format!("registration {id} has a malformed blinded token"))?;
                let blind_signature: blindvote::Signature = row
                    .try_get::<String, _>("blind_signature")?
                    .parse()
                    .with_context(|| format!("registration {id} has a malformed signature"))?;

                Ok(Registration {
                    id,
                    election_id: election_id(row)?,
                    voter_address: voter_address(row)?,
                    blinded_token,
                    blind_signature,
                    state: submission_state(row)?,
                })
            })
            .collect()
    }

    async fn update_status(
        &self,
        id: i64,
        status: RecordStatus,
        tx_hash: Option<B256>,
        batch_id: Option<&str>,
    ) -> eyre::Result<()> {
        self.update("registrations", id, status, tx_hash, batch_id)
            .await
    }
}
