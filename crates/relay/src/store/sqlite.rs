use super::{SessionStore, effective_ttl_secs};
use crate::error::StoreError;
use crate::session::{SessionPatch, SessionRecord, unix_now_secs};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row as _;

/// Embedded SQL backend. The full record lives as a JSON document in the
/// `record` column; `identity`, `active`, `revision`, and `expires_at` are
/// duplicated as columns so filters and the CAS check run in SQL. SQLite has
/// no native TTL, so expiry is enforced in every read and reclaimed by the
/// explicit sweep.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and bootstrap the schema. `url` is a sqlx SQLite URL, e.g.
    /// `sqlite:///var/lib/relay/sessions.db?mode=rwc`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(StoreError::backend)?;

        sqlx::query(
            r"
create table if not exists sessions (
  session_id text primary key,
  identity   text not null,
  record     text not null,
  revision   integer not null,
  active     integer not null,
  expires_at integer not null
)
",
        )
        .execute(&pool)
        .await
        .map_err(StoreError::backend)?;

        sqlx::query(
            r"
create index if not exists sessions_identity_idx on sessions (identity)
",
        )
        .execute(&pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now_i64() -> i64 {
    i64::try_from(unix_now_secs()).unwrap_or(i64::MAX)
}

fn expires_at_i64(now: i64, ttl_secs: u64) -> i64 {
    now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX))
}

fn decode_record(json: &str) -> Result<SessionRecord, StoreError> {
    serde_json::from_str(json).map_err(StoreError::backend)
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(
        &self,
        record: &SessionRecord,
        ttl_secs: Option<u64>,
    ) -> Result<(), StoreError> {
        let now = now_i64();
        // An expired row may still be lying around; it must not block reuse
        // of the id any more than it may satisfy reads.
        sqlx::query(
            r"
delete from sessions
where session_id = $1
  and expires_at <= $2
",
        )
        .bind(&record.session_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        let json = serde_json::to_string(record).map_err(StoreError::backend)?;
        let res = sqlx::query(
            r"
insert into sessions (session_id, identity, record, revision, active, expires_at)
values ($1, $2, $3, $4, $5, $6)
",
        )
        .bind(&record.session_id)
        .bind(&record.identity)
        .bind(&json)
        .bind(i64::try_from(record.revision).unwrap_or(i64::MAX))
        .bind(record.active)
        .bind(expires_at_i64(now, effective_ttl_secs(ttl_secs)))
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateSession(record.session_id.clone()))
            }
            Err(e) => Err(StoreError::backend(e)),
        }
    }

    async fn update_session(
        &self,
        identity: &str,
        session_id: &str,
        patch: SessionPatch,
        expected_revision: Option<u64>,
        ttl_secs: Option<u64>,
    ) -> Result<SessionRecord, StoreError> {
        let now = now_i64();
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        let row = sqlx::query(
            r"
select record, revision
from sessions
where session_id = $1
  and identity = $2
  and expires_at > $3
",
        )
        .bind(session_id)
        .bind(identity)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::backend)?;

        let Some(row) = row else {
            return Err(StoreError::NotFound {
                identity: identity.to_string(),
                session_id: session_id.to_string(),
            });
        };

        let revision: i64 = row.try_get("revision").map_err(StoreError::backend)?;
        let found = u64::try_from(revision).unwrap_or_default();
        if let Some(expected) = expected_revision
            && found != expected
        {
            return Err(StoreError::RevisionConflict {
                session_id: session_id.to_string(),
                expected,
                found,
            });
        }

        let json: String = row.try_get("record").map_err(StoreError::backend)?;
        let mut record = decode_record(&json)?;
        patch.apply(&mut record);
        record.revision = found + 1;

        let json = serde_json::to_string(&record).map_err(StoreError::backend)?;
        if let Some(ttl) = ttl_secs {
            sqlx::query(
                r"
update sessions
set record = $1, revision = $2, active = $3, expires_at = $4
where session_id = $5
",
            )
            .bind(&json)
            .bind(i64::try_from(record.revision).unwrap_or(i64::MAX))
            .bind(record.active)
            .bind(expires_at_i64(now, ttl))
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        } else {
            sqlx::query(
                r"
update sessions
set record = $1, revision = $2, active = $3
where session_id = $4
",
            )
            .bind(&json)
            .bind(i64::try_from(record.revision).unwrap_or(i64::MAX))
            .bind(record.active)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        }

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(record)
    }

    async fn get_session(
        &self,
        identity: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query(
            r"
select record
from sessions
where session_id = $1
  and identity = $2
  and expires_at > $3
",
        )
        .bind(session_id)
        .bind(identity)
        .bind(now_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        match row {
            Some(row) => {
                let json: String = row.try_get("record").map_err(StoreError::backend)?;
                Ok(Some(decode_record(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn sessions_for_identity(
        &self,
        identity: &str,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query(
            r"
select record
from sessions
where identity = $1
  and active = true
  and expires_at > $2
order by session_id asc
",
        )
        .bind(identity)
        .bind(now_i64())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.try_get("record").map_err(StoreError::backend)?;
            out.push(decode_record(&json)?);
        }
        Ok(out)
    }

    async fn session_ids_for_identity(&self, identity: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r"
select session_id
from sessions
where identity = $1
  and expires_at > $2
order by session_id asc
",
        )
        .bind(identity)
        .bind(now_i64())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("session_id").map_err(StoreError::backend))
            .collect()
    }

    async fn remove_session(&self, identity: &str, session_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
delete from sessions
where session_id = $1
  and identity = $2
",
        )
        .bind(session_id)
        .bind(identity)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn cleanup_expired_sessions(&self) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r"
delete from sessions
where expires_at <= $1
",
        )
        .bind(now_i64())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(res.rows_affected())
    }
}
