use async_trait::async_trait;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Bool, Text, Timestamptz};
use diesel::{prelude::*, sql_query, PgConnection};
use thiserror::Error;
use tracing::warn;

use crate::db::PgPool;
use crate::models::{Attachment, AttachmentKind, NewAttachment};

/// Columns added after the first deployments; older tables may lack them.
pub const OPTIONAL_COLUMNS: &[&str] = &["content_size", "content_type", "created_at"];

const FULL_SELECT: &str =
    "id, owner_id, description, stored_path, access_token, content_size, content_type, created_at";
const MINIMAL_SELECT: &str = "id, owner_id, description, stored_path, access_token, \
     NULL::bigint AS content_size, NULL::text AS content_type, NULL::timestamptz AS created_at";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database pool error: {0}")]
    Pool(String),
    #[error(transparent)]
    Database(#[from] DieselError),
    #[error("database task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait AttachmentRepository: Send + Sync + 'static {
    async fn owner_exists(
        &self,
        kind: AttachmentKind,
        owner_id: i64,
    ) -> Result<bool, RepositoryError>;

    async fn insert(
        &self,
        kind: AttachmentKind,
        attachment: NewAttachment,
    ) -> Result<Attachment, RepositoryError>;

    async fn find(&self, kind: AttachmentKind, id: i64)
        -> Result<Option<Attachment>, RepositoryError>;

    /// Row matching both `id` and `token`; any mismatch is `None`.
    async fn find_by_capability(
        &self,
        kind: AttachmentKind,
        id: i64,
        token: &str,
    ) -> Result<Option<Attachment>, RepositoryError>;

    async fn list_by_owner(
        &self,
        kind: AttachmentKind,
        owner_id: i64,
    ) -> Result<Vec<Attachment>, RepositoryError>;

    async fn list_all(&self, kind: AttachmentKind) -> Result<Vec<Attachment>, RepositoryError>;

    /// Removes the row, reporting whether one existed.
    async fn delete(&self, kind: AttachmentKind, id: i64) -> Result<bool, RepositoryError>;
}

pub struct PgAttachmentRepository {
    pool: PgPool,
}

impl PgAttachmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn run<F, T>(&self, work: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, RepositoryError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| RepositoryError::Pool(err.to_string()))?;
            work(&mut conn)
        })
        .await
        .map_err(|err| RepositoryError::Task(err.to_string()))?
    }
}

#[async_trait]
impl AttachmentRepository for PgAttachmentRepository {
    async fn owner_exists(
        &self,
        kind: AttachmentKind,
        owner_id: i64,
    ) -> Result<bool, RepositoryError> {
        self.run(move |conn| {
            let row: Exists = sql_query(format!(
                "SELECT EXISTS (SELECT 1 FROM {} WHERE id = $1) AS present",
                kind.owner_table()
            ))
            .bind::<BigInt, _>(owner_id)
            .get_result(conn)?;
            Ok(row.present)
        })
        .await
    }

    async fn insert(
        &self,
        kind: AttachmentKind,
        attachment: NewAttachment,
    ) -> Result<Attachment, RepositoryError> {
        self.run(move |conn| {
            let table = kind.table();
            with_schema_fallback(
                conn,
                |conn| {
                    sql_query(format!(
                        "INSERT INTO {table} \
                         (owner_id, description, stored_path, access_token, content_size, content_type, created_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {FULL_SELECT}"
                    ))
                    .bind::<BigInt, _>(attachment.owner_id)
                    .bind::<Text, _>(&attachment.description)
                    .bind::<Text, _>(&attachment.stored_path)
                    .bind::<Text, _>(&attachment.access_token)
                    .bind::<BigInt, _>(attachment.content_size)
                    .bind::<Text, _>(&attachment.content_type)
                    .bind::<Timestamptz, _>(attachment.created_at)
                    .get_result(conn)
                },
                |conn, err| is_schema_drift(conn, table, err),
                |conn| {
                    sql_query(format!(
                        "INSERT INTO {table} (owner_id, description, stored_path, access_token) \
                         VALUES ($1, $2, $3, $4) RETURNING {MINIMAL_SELECT}"
                    ))
                    .bind::<BigInt, _>(attachment.owner_id)
                    .bind::<Text, _>(&attachment.description)
                    .bind::<Text, _>(&attachment.stored_path)
                    .bind::<Text, _>(&attachment.access_token)
                    .get_result(conn)
                },
            )
        })
        .await
    }

    async fn find(
        &self,
        kind: AttachmentKind,
        id: i64,
    ) -> Result<Option<Attachment>, RepositoryError> {
        self.run(move |conn| {
            select_with_fallback(conn, kind, "WHERE id = $1", |query| {
                query.bind::<BigInt, _>(id)
            })
            .map(|mut rows| rows.pop())
        })
        .await
    }

    async fn find_by_capability(
        &self,
        kind: AttachmentKind,
        id: i64,
        token: &str,
    ) -> Result<Option<Attachment>, RepositoryError> {
        let token = token.to_string();
        self.run(move |conn| {
            select_with_fallback(
                conn,
                kind,
                "WHERE id = $1 AND access_token = $2",
                |query| query.bind::<BigInt, _>(id).bind::<Text, _>(token.clone()),
            )
            .map(|mut rows| rows.pop())
        })
        .await
    }

    async fn list_by_owner(
        &self,
        kind: AttachmentKind,
        owner_id: i64,
    ) -> Result<Vec<Attachment>, RepositoryError> {
        self.run(move |conn| {
            select_with_fallback(conn, kind, "WHERE owner_id = $1 ORDER BY id DESC", |query| {
                query.bind::<BigInt, _>(owner_id)
            })
        })
        .await
    }

    async fn list_all(&self, kind: AttachmentKind) -> Result<Vec<Attachment>, RepositoryError> {
        self.run(move |conn| select_with_fallback(conn, kind, "ORDER BY id", |query| query))
            .await
    }

    async fn delete(&self, kind: AttachmentKind, id: i64) -> Result<bool, RepositoryError> {
        self.run(move |conn| {
            let removed = sql_query(format!("DELETE FROM {} WHERE id = $1", kind.table()))
                .bind::<BigInt, _>(id)
                .execute(conn)?;
            Ok(removed > 0)
        })
        .await
    }
}

#[derive(QueryableByName)]
struct Exists {
    #[diesel(sql_type = Bool)]
    present: bool,
}

#[derive(QueryableByName)]
struct ColumnName {
    #[diesel(sql_type = Text)]
    column_name: String,
}

fn select_with_fallback<Q, B>(
    conn: &mut PgConnection,
    kind: AttachmentKind,
    clause: &str,
    bind: B,
) -> Result<Vec<Attachment>, RepositoryError>
where
    B: Fn(diesel::query_builder::SqlQuery) -> Q,
    Q: RunQueryDsl<PgConnection> + diesel::query_dsl::LoadQuery<'static, PgConnection, Attachment>,
{
    let table = kind.table();
    with_schema_fallback(
        conn,
        |conn| bind(sql_query(format!("SELECT {FULL_SELECT} FROM {table} {clause}"))).load(conn),
        |conn, err| is_schema_drift(conn, table, err),
        |conn| bind(sql_query(format!("SELECT {MINIMAL_SELECT} FROM {table} {clause}"))).load(conn),
    )
}

/// Runs `full`; if it fails and `drifted` confirms the table lacks optional
/// columns, runs `minimal` exactly once. Other failures propagate untouched.
pub fn with_schema_fallback<C, T, E, F, D, M>(
    conn: &mut C,
    full: F,
    drifted: D,
    minimal: M,
) -> Result<T, RepositoryError>
where
    E: Into<RepositoryError>,
    F: FnOnce(&mut C) -> Result<T, E>,
    D: FnOnce(&mut C, &E) -> Result<bool, RepositoryError>,
    M: FnOnce(&mut C) -> Result<T, E>,
{
    match full(conn) {
        Ok(value) => Ok(value),
        Err(err) => {
            if drifted(conn, &err)? {
                minimal(conn).map_err(Into::into)
            } else {
                Err(err.into())
            }
        }
    }
}

/// Postgres reports an unknown column as an unclassified database error, so
/// the catalog decides: drift only when optional columns are really absent.
fn is_schema_drift(
    conn: &mut PgConnection,
    table: &str,
    err: &DieselError,
) -> Result<bool, RepositoryError> {
    if !matches!(err, DieselError::DatabaseError(DatabaseErrorKind::Unknown, _)) {
        return Ok(false);
    }

    let present: Vec<ColumnName> = sql_query(
        "SELECT column_name::text AS column_name FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name = $1",
    )
    .bind::<Text, _>(table)
    .load(conn)?;
    if present.is_empty() {
        return Ok(false);
    }

    let missing = missing_optional_columns(present.iter().map(|row| row.column_name.as_str()));
    if missing.is_empty() {
        return Ok(false);
    }

    warn!(
        table,
        missing = ?missing,
        error = %err,
        "attachment table lacks optional columns; retrying with minimal column set"
    );
    Ok(true)
}

fn missing_optional_columns<'a>(present: impl Iterator<Item = &'a str> + Clone) -> Vec<&'static str> {
    OPTIONAL_COLUMNS
        .iter()
        .copied()
        .filter(|column| !present.clone().any(|name| name == *column))
        .collect()
}
