//! Shared database handle and the claim transaction.
//!
//! Everything dialect-specific funnels through here: the two sqlx pools,
//! batched inserts via `QueryBuilder`, and the canonical `?`-placeholder
//! queries rebound per dialect before execution.

use chrono::NaiveDateTime;
use sqlx::{Connection, FromRow, MySql, MySqlPool, PgPool, Postgres, QueryBuilder, Transaction};

use crate::db::dialect::{Dialect, placeholder_list};
use crate::error::QueueResult;

/// One row claimed from the `message` table.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct MessageRow {
    pub id: i64,
    pub payload: Vec<u8>,
    pub retries: i32,
}

// Canonical query texts. `?` placeholders are rebound per dialect at the
// call site.
const SELECT_READY: &str = "SELECT id, payload, retries FROM message \
                            WHERE ready_at <= ? ORDER BY ready_at ASC LIMIT ? \
                            FOR UPDATE SKIP LOCKED";
const REQUEUE: &str = "UPDATE message SET retries = ?, ready_at = ? WHERE id = ?";
const INSERT_PREFIX: &str = "INSERT INTO message (payload) ";

/// Database handle shared by the client and every worker.
///
/// Both sqlx pool types are reference-counted internally, so cloning a
/// `QueueDb` is cheap and every clone multiplexes over the same pool.
#[derive(Debug, Clone)]
pub enum QueueDb {
    MySql(MySqlPool),
    Postgres(PgPool),
}

impl From<MySqlPool> for QueueDb {
    fn from(pool: MySqlPool) -> Self {
        QueueDb::MySql(pool)
    }
}

impl From<PgPool> for QueueDb {
    fn from(pool: PgPool) -> Self {
        QueueDb::Postgres(pool)
    }
}

impl QueueDb {
    /// Open a pool for the named dialect (`"mysql"`, `"postgres"`, or the
    /// aliases `"pg"` / `"pgx"`). Unknown names fail before any connection
    /// attempt.
    pub async fn connect(dialect: &str, url: &str) -> QueueResult<Self> {
        match dialect.parse::<Dialect>()? {
            Dialect::MySql => Ok(QueueDb::MySql(MySqlPool::connect(url).await?)),
            Dialect::Postgres => Ok(QueueDb::Postgres(PgPool::connect(url).await?)),
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            QueueDb::MySql(_) => Dialect::MySql,
            QueueDb::Postgres(_) => Dialect::Postgres,
        }
    }

    /// Round-trip liveness check; engine constructors fail on this.
    pub(crate) async fn ping(&self) -> sqlx::Result<()> {
        match self {
            QueueDb::MySql(pool) => {
                let mut conn = pool.acquire().await?;
                conn.ping().await
            }
            QueueDb::Postgres(pool) => {
                let mut conn = pool.acquire().await?;
                conn.ping().await
            }
        }
    }

    /// Run schema statements inside one transaction.
    pub(crate) async fn exec_schema(&self, statements: &[&str]) -> sqlx::Result<()> {
        match self {
            QueueDb::MySql(pool) => {
                let mut tx = pool.begin().await?;
                for stmt in statements {
                    sqlx::query(stmt).execute(&mut *tx).await?;
                }
                tx.commit().await
            }
            QueueDb::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                for stmt in statements {
                    sqlx::query(stmt).execute(&mut *tx).await?;
                }
                tx.commit().await
            }
        }
    }

    /// Multi-row `INSERT INTO message (payload) VALUES (?), (?), ...`.
    ///
    /// One placeholder per payload; callers keep the slice within the
    /// placeholder ceiling.
    pub(crate) async fn insert_payloads(&self, payloads: &[Vec<u8>]) -> sqlx::Result<u64> {
        match self {
            QueueDb::MySql(pool) => {
                let mut qb: QueryBuilder<MySql> = QueryBuilder::new(INSERT_PREFIX);
                qb.push_values(payloads, |mut b, payload| {
                    b.push_bind(payload.as_slice());
                });
                Ok(qb.build().execute(pool).await?.rows_affected())
            }
            QueueDb::Postgres(pool) => {
                let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(INSERT_PREFIX);
                qb.push_values(payloads, |mut b, payload| {
                    b.push_bind(payload.as_slice());
                });
                Ok(qb.build().execute(pool).await?.rows_affected())
            }
        }
    }

    /// Open a claim transaction.
    pub(crate) async fn begin(&self) -> sqlx::Result<ClaimTx> {
        match self {
            QueueDb::MySql(pool) => Ok(ClaimTx::MySql(pool.begin().await?)),
            QueueDb::Postgres(pool) => Ok(ClaimTx::Postgres(pool.begin().await?)),
        }
    }
}

/// A claim transaction.
///
/// Rows returned by `select_ready` stay row-locked until `commit`;
/// dropping the transaction uncommitted rolls back and the rows revert to
/// their pre-claim state.
pub(crate) enum ClaimTx {
    MySql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
}

impl ClaimTx {
    /// Claim up to `limit` ready rows under `FOR UPDATE SKIP LOCKED`.
    ///
    /// `now` is sampled once per tick by the caller so the visibility cutoff
    /// is consistent across the whole batch.
    pub(crate) async fn select_ready(
        &mut self,
        now: NaiveDateTime,
        limit: i64,
    ) -> sqlx::Result<Vec<MessageRow>> {
        match self {
            ClaimTx::MySql(tx) => {
                let query = Dialect::MySql.rebind(SELECT_READY);
                sqlx::query_as::<_, MessageRow>(&query)
                    .bind(now)
                    .bind(limit)
                    .fetch_all(&mut **tx)
                    .await
            }
            ClaimTx::Postgres(tx) => {
                let query = Dialect::Postgres.rebind(SELECT_READY);
                sqlx::query_as::<_, MessageRow>(&query)
                    .bind(now)
                    .bind(limit)
                    .fetch_all(&mut **tx)
                    .await
            }
        }
    }

    /// Push a failed row's next attempt into the future.
    pub(crate) async fn requeue(
        &mut self,
        id: i64,
        retries: i32,
        ready_at: NaiveDateTime,
    ) -> sqlx::Result<()> {
        match self {
            ClaimTx::MySql(tx) => {
                let query = Dialect::MySql.rebind(REQUEUE);
                sqlx::query(&query)
                    .bind(retries)
                    .bind(ready_at)
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
            }
            ClaimTx::Postgres(tx) => {
                let query = Dialect::Postgres.rebind(REQUEUE);
                sqlx::query(&query)
                    .bind(retries)
                    .bind(ready_at)
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }

    /// Delete the given ids with an expanded `IN (?, ?, ...)` list.
    pub(crate) async fn delete_ids(&mut self, ids: &[i64]) -> sqlx::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let canonical = format!(
            "DELETE FROM message WHERE id IN ({})",
            placeholder_list(ids.len())
        );
        match self {
            ClaimTx::MySql(tx) => {
                let query = Dialect::MySql.rebind(&canonical);
                let mut q = sqlx::query(&query);
                for id in ids {
                    q = q.bind(*id);
                }
                Ok(q.execute(&mut **tx).await?.rows_affected())
            }
            ClaimTx::Postgres(tx) => {
                let query = Dialect::Postgres.rebind(&canonical);
                let mut q = sqlx::query(&query);
                for id in ids {
                    q = q.bind(*id);
                }
                Ok(q.execute(&mut **tx).await?.rows_affected())
            }
        }
    }

    pub(crate) async fn commit(self) -> sqlx::Result<()> {
        match self {
            ClaimTx::MySql(tx) => tx.commit().await,
            ClaimTx::Postgres(tx) => tx.commit().await,
        }
    }
}
