//! Postgres-backed [`KeyValueBackend`] via direct SQLx.
//!
//! Each primitive maps to one table (see `migrations/`). Batches run in a
//! single transaction. Key expiry is evaluated against the database clock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};

use super::{KeyValueBackend, Op};
use crate::clock::millis;
use crate::error::{Error, Result};

/// Row filter for keys that have not expired.
const LIVE: &str = "(expires_at IS NULL OR expires_at > now())";

/// `$3` is an optional TTL in milliseconds.
const EXPIRES_AT: &str =
    "CASE WHEN $3::bigint IS NULL THEN NULL ELSE now() + $3::bigint * interval '1 millisecond' END";

/// Database handle. Owns the connection pool.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Drop expired keys. Reads already ignore them; this only reclaims space.
    pub async fn purge_expired(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM kv_strings WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

fn ttl_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(millis)
}

/// Check a precondition step, locking the row it depends on until the
/// transaction ends. Writes always hold.
async fn holds_on(conn: &mut PgConnection, op: &Op) -> Result<bool> {
    let row: Option<(i32,)> = match op {
        Op::RequireMember { key, member } => {
            sqlx::query_as(
                "SELECT 1 FROM kv_sorted_sets WHERE key = $1 AND member = $2 FOR UPDATE",
            )
            .bind(key)
            .bind(member)
            .fetch_optional(&mut *conn)
            .await?
        }
        Op::RequireField { key, field } => {
            sqlx::query_as("SELECT 1 FROM kv_hashes WHERE key = $1 AND field = $2 FOR UPDATE")
                .bind(key)
                .bind(field)
                .fetch_optional(&mut *conn)
                .await?
        }
        _ => return Ok(true),
    };
    Ok(row.is_some())
}

async fn apply(conn: &mut PgConnection, op: Op) -> Result<()> {
    match op {
        Op::RequireMember { .. } | Op::RequireField { .. } => {}
        Op::ZAdd { key, member, score } => {
            sqlx::query(
                "INSERT INTO kv_sorted_sets (key, member, score) VALUES ($1, $2, $3)
                 ON CONFLICT (key, member) DO UPDATE SET score = EXCLUDED.score",
            )
            .bind(key)
            .bind(member)
            .bind(score)
            .execute(&mut *conn)
            .await?;
        }
        Op::ZRem { key, member } => {
            sqlx::query("DELETE FROM kv_sorted_sets WHERE key = $1 AND member = $2")
                .bind(key)
                .bind(member)
                .execute(&mut *conn)
                .await?;
        }
        Op::HSet { key, field, value } => {
            sqlx::query(
                "INSERT INTO kv_hashes (key, field, value) VALUES ($1, $2, $3)
                 ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value",
            )
            .bind(key)
            .bind(field)
            .bind(value)
            .execute(&mut *conn)
            .await?;
        }
        Op::HDel { key, field } => {
            sqlx::query("DELETE FROM kv_hashes WHERE key = $1 AND field = $2")
                .bind(key)
                .bind(field)
                .execute(&mut *conn)
                .await?;
        }
        Op::HIncrBy { key, field, delta } => {
            hincr_on(conn, &key, &field, delta).await?;
        }
        Op::HDelIfEq { key, field, value } => {
            sqlx::query("DELETE FROM kv_hashes WHERE key = $1 AND field = $2 AND value = $3")
                .bind(key)
                .bind(field)
                .bind(value)
                .execute(&mut *conn)
                .await?;
        }
        Op::Set { key, value, ttl } => {
            sqlx::query(&format!(
                "INSERT INTO kv_strings (key, value, expires_at) VALUES ($1, $2, {EXPIRES_AT})
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at"
            ))
            .bind(key)
            .bind(value)
            .bind(ttl_millis(ttl))
            .execute(&mut *conn)
            .await?;
        }
        Op::Expire { key, ttl } => {
            expire_on(conn, &key, ttl).await?;
        }
        Op::Del { key } => {
            sqlx::query("DELETE FROM kv_strings WHERE key = $1")
                .bind(key)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

async fn hincr_on(conn: &mut PgConnection, key: &str, field: &str, delta: i64) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO kv_hashes (key, field, value) VALUES ($1, $2, $3::bigint::text)
         ON CONFLICT (key, field) DO UPDATE SET value = (kv_hashes.value::bigint + $3::bigint)::text
         RETURNING value::bigint",
    )
    .bind(key)
    .bind(field)
    .bind(delta)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.0)
}

async fn expire_on(conn: &mut PgConnection, key: &str, ttl: Duration) -> Result<bool> {
    let done = sqlx::query(&format!(
        "UPDATE kv_strings SET expires_at = now() + $2::bigint * interval '1 millisecond'
         WHERE key = $1 AND {LIVE}"
    ))
    .bind(key)
    .bind(millis(ttl))
    .execute(&mut *conn)
    .await?;
    Ok(done.rows_affected() > 0)
}

#[async_trait]
impl KeyValueBackend for PgBackend {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        apply(&mut *conn, Op::zadd(key, member, score)).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM kv_sorted_sets WHERE key = $1 AND member = $2")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT score FROM kv_sorted_sets WHERE key = $1 AND member = $2")
                .bind(key)
                .bind(member)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>> {
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT member, score FROM kv_sorted_sets
             WHERE key = $1 AND score BETWEEN $2 AND $3
             ORDER BY score ASC, member ASC
             LIMIT $4",
        )
        .bind(key)
        .bind(min)
        .bind(max)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM kv_sorted_sets WHERE key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM kv_sorted_sets WHERE key = $1 AND score BETWEEN $2 AND $3",
        )
        .bind(key)
        .bind(min)
        .bind(max)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        apply(&mut *conn, Op::hset(key, field, value)).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM kv_hashes WHERE key = $1 AND field = $2")
                .bind(key)
                .bind(field)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        hincr_on(&mut *conn, key, field, delta).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM kv_hashes WHERE key = $1 AND field = $2")
            .bind(key)
            .bind(field)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT field, value FROM kv_hashes WHERE key = $1")
                .bind(key)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM kv_hashes WHERE key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        sqlx::query("INSERT INTO kv_sets (key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM kv_sets WHERE key = $1 AND member = $2")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM kv_sets WHERE key = $1 AND member = $2)",
        )
        .bind(key)
        .bind(member)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT value FROM kv_strings WHERE key = $1 AND {LIVE}"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        apply(
            &mut *conn,
            Op::Set {
                key: key.to_string(),
                value: value.to_string(),
                ttl,
            },
        )
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        // The conflict branch only fires over an expired key, so a live
        // holder is never overwritten.
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "INSERT INTO kv_strings (key, value, expires_at) VALUES ($1, $2, {EXPIRES_AT})
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
             WHERE kv_strings.expires_at IS NOT NULL AND kv_strings.expires_at <= now()
             RETURNING key"
        ))
        .bind(key)
        .bind(value)
        .bind(ttl_millis(ttl))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO kv_strings (key, value, expires_at) VALUES ($1, $2::bigint::text, NULL)
             ON CONFLICT (key) DO UPDATE SET
               value = (CASE WHEN kv_strings.expires_at <= now() THEN 0
                             ELSE kv_strings.value::bigint END + $2::bigint)::text,
               expires_at = CASE WHEN kv_strings.expires_at <= now() THEN NULL
                                 ELSE kv_strings.expires_at END
             RETURNING value::bigint",
        )
        .bind(key)
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        expire_on(&mut *conn, key, ttl).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(&format!(
            "DELETE FROM kv_strings WHERE key = $1 RETURNING {LIVE}"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some_and(|r| r.0))
    }

    async fn exec(&self, ops: Vec<Op>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        for op in &ops {
            if !holds_on(&mut *tx, op).await? {
                tx.rollback().await?;
                return Ok(false);
            }
        }
        for op in ops {
            apply(&mut *tx, op).await?;
        }
        tx.commit().await?;
        Ok(true)
    }
}
