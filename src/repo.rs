use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::query_builder::Separated;
use sqlx::{Execute, FromRow, PgExecutor, Postgres, QueryBuilder, Row};
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// A composable predicate: appends ` AND <cond>` to the builder, binding its
/// own parameters. Scopes are pure and reusable across queries.
pub type Scope = Arc<dyn for<'a> Fn(&mut QueryBuilder<'a, Postgres>) + Send + Sync>;

/// Appends a full ` ORDER BY …` clause, binding parameters where needed.
pub type OrderBy = Arc<dyn for<'a> Fn(&mut QueryBuilder<'a, Postgres>) + Send + Sync>;

/// Owned bind value so the repository can build inserts, full updates, and
/// partial patches from one column/value listing.
#[derive(Debug, Clone)]
pub enum SqlVal {
    Uuid(Uuid),
    OptUuid(Option<Uuid>),
    Str(String),
    OptStr(Option<String>),
    Bool(bool),
    I32(i32),
    I64(i64),
    OptI64(Option<i64>),
    Timestamp(DateTime<Utc>),
    OptTimestamp(Option<DateTime<Utc>>),
    Json(Value),
}

impl SqlVal {
    fn push(self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        match self {
            SqlVal::Uuid(v) => row.push_bind(v),
            SqlVal::OptUuid(v) => row.push_bind(v),
            SqlVal::Str(v) => row.push_bind(v),
            SqlVal::OptStr(v) => row.push_bind(v),
            SqlVal::Bool(v) => row.push_bind(v),
            SqlVal::I32(v) => row.push_bind(v),
            SqlVal::I64(v) => row.push_bind(v),
            SqlVal::OptI64(v) => row.push_bind(v),
            SqlVal::Timestamp(v) => row.push_bind(v),
            SqlVal::OptTimestamp(v) => row.push_bind(v),
            SqlVal::Json(v) => row.push_bind(v),
        };
    }

    fn push_qb<'a>(self, qb: &mut QueryBuilder<'a, Postgres>) {
        match self {
            SqlVal::Uuid(v) => qb.push_bind(v),
            SqlVal::OptUuid(v) => qb.push_bind(v),
            SqlVal::Str(v) => qb.push_bind(v),
            SqlVal::OptStr(v) => qb.push_bind(v),
            SqlVal::Bool(v) => qb.push_bind(v),
            SqlVal::I32(v) => qb.push_bind(v),
            SqlVal::I64(v) => qb.push_bind(v),
            SqlVal::OptI64(v) => qb.push_bind(v),
            SqlVal::Timestamp(v) => qb.push_bind(v),
            SqlVal::OptTimestamp(v) => qb.push_bind(v),
            SqlVal::Json(v) => qb.push_bind(v),
        };
    }
}

/// A row-mapped table entity the generic repository can manage.
///
/// `COLUMNS` lists the client-supplied columns (`id` first); `values()`
/// returns binds aligned with it. Server-maintained timestamps stay out of
/// the listing and come back via `FromRow`.
pub trait Entity: for<'r> FromRow<'r, PgRow> + Send + Sync + Unpin {
    const TABLE: &'static str;
    /// Domain tag for `<domain>.not_found` problem codes.
    const DOMAIN: &'static str;
    const COLUMNS: &'static [&'static str];
    /// Whether patches should touch `updated_at`.
    const TOUCH_UPDATED_AT: bool = true;
    const DEFAULT_ORDER: &'static str = "created_at DESC";

    fn id(&self) -> Uuid;
    fn values(&self) -> Vec<SqlVal>;
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: i64,
    pub page_size: i64,
}

impl Page {
    pub const MAX_PAGE_SIZE: i64 = 100;

    pub fn from_query(query: &PageQuery) -> Self {
        Page {
            page: query.page.unwrap_or(1).max(1),
            page_size: query
                .page_size
                .unwrap_or(20)
                .clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    fn offset(&self) -> i64 {
        (self.page - 1) * self.page_size
    }
}

impl Default for Page {
    fn default() -> Self {
        Page {
            page: 1,
            page_size: 20,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEnvelope<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub page_size: i64,
    pub total_count: i64,
    pub total_pages: i64,
    pub has_more: bool,
}

impl<T> ListEnvelope<T> {
    pub fn new(items: Vec<T>, page: Page, total_count: i64) -> Self {
        let total_pages = if total_count == 0 {
            0
        } else {
            (total_count + page.page_size - 1) / page.page_size
        };
        ListEnvelope {
            has_more: page.page < total_pages,
            items,
            page: page.page,
            page_size: page.page_size,
            total_count,
            total_pages,
        }
    }
}

pub fn scope_workspace_id(workspace_id: Uuid) -> Scope {
    Arc::new(move |qb| {
        qb.push(" AND workspace_id = ");
        qb.push_bind(workspace_id);
    })
}

pub fn scope_business_id(business_id: Uuid) -> Scope {
    Arc::new(move |qb| {
        qb.push(" AND business_id = ");
        qb.push_bind(business_id);
    })
}

pub fn scope_id(id: Uuid) -> Scope {
    Arc::new(move |qb| {
        qb.push(" AND id = ");
        qb.push_bind(id);
    })
}

pub fn scope_ids(ids: Vec<Uuid>) -> Scope {
    Arc::new(move |qb| {
        qb.push(" AND id = ANY(");
        qb.push_bind(ids.clone());
        qb.push(")");
    })
}

pub fn scope_created_between(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Scope {
    Arc::new(move |qb| {
        if let Some(from) = from {
            qb.push(" AND created_at >= ");
            qb.push_bind(from);
        }
        if let Some(to) = to {
            qb.push(" AND created_at < ");
            qb.push_bind(to);
        }
    })
}

/// Generic repository over an [`Entity`]. Every method takes an executor so
/// callers hand in either the pool or the enclosing transaction.
pub struct Repo<T: Entity>(PhantomData<T>);

impl<T: Entity> Default for Repo<T> {
    fn default() -> Self {
        Repo(PhantomData)
    }
}

impl<T: Entity> Repo<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_builder(entities: &[T]) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            T::TABLE,
            T::COLUMNS.join(", ")
        ));
        qb.push_values(entities, |mut row, entity| {
            for value in entity.values() {
                value.push(&mut row);
            }
        });
        qb
    }

    pub async fn create_one<'e, E: PgExecutor<'e>>(&self, ex: E, entity: &T) -> AppResult<()> {
        let mut qb = Self::insert_builder(std::slice::from_ref(entity));
        qb.build().execute(ex).await?;
        Ok(())
    }

    /// Bulk insert, skipping rows that already exist.
    pub async fn create_many<'e, E: PgExecutor<'e>>(&self, ex: E, entities: &[T]) -> AppResult<u64> {
        if entities.is_empty() {
            return Ok(0);
        }
        let mut qb = Self::insert_builder(entities);
        qb.push(" ON CONFLICT DO NOTHING");
        let result = qb.build().execute(ex).await?;
        Ok(result.rows_affected())
    }

    /// Bulk upsert keyed on `id`.
    pub async fn upsert_many<'e, E: PgExecutor<'e>>(&self, ex: E, entities: &[T]) -> AppResult<u64> {
        if entities.is_empty() {
            return Ok(0);
        }
        let mut qb = Self::insert_builder(entities);
        qb.push(" ON CONFLICT (id) DO UPDATE SET ");
        let mut first = true;
        for column in T::COLUMNS.iter().skip(1) {
            if !first {
                qb.push(", ");
            }
            qb.push(format!("{column} = EXCLUDED.{column}"));
            first = false;
        }
        if T::TOUCH_UPDATED_AT {
            qb.push(", updated_at = NOW()");
        }
        let result = qb.build().execute(ex).await?;
        Ok(result.rows_affected())
    }

    /// Full replace of one row.
    pub async fn update_one<'e, E: PgExecutor<'e>>(&self, ex: E, entity: &T) -> AppResult<()> {
        let mut qb = QueryBuilder::new(format!("UPDATE {} SET ", T::TABLE));
        let mut first = true;
        for (column, value) in T::COLUMNS.iter().skip(1).zip(entity.values().into_iter().skip(1)) {
            if !first {
                qb.push(", ");
            }
            qb.push(format!("{column} = "));
            value.push_qb(&mut qb);
            first = false;
        }
        if T::TOUCH_UPDATED_AT {
            qb.push(", updated_at = NOW()");
        }
        qb.push(" WHERE id = ");
        qb.push_bind(entity.id());
        let result = qb.build().execute(ex).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(T::DOMAIN));
        }
        Ok(())
    }

    /// Partial update; returns the updated row.
    pub async fn patch_one<'e, E: PgExecutor<'e>>(
        &self,
        ex: E,
        id: Uuid,
        patch: Vec<(&'static str, SqlVal)>,
        scopes: &[Scope],
    ) -> AppResult<T> {
        if patch.is_empty() {
            return Err(AppError::Message("empty patch".into()));
        }
        for (column, _) in &patch {
            if !T::COLUMNS.contains(column) {
                return Err(AppError::Message(format!(
                    "patch column {column} not in {}",
                    T::TABLE
                )));
            }
        }
        let mut qb = QueryBuilder::new(format!("UPDATE {} SET ", T::TABLE));
        let mut first = true;
        for (column, value) in patch {
            if !first {
                qb.push(", ");
            }
            qb.push(format!("{column} = "));
            value.push_qb(&mut qb);
            first = false;
        }
        if T::TOUCH_UPDATED_AT {
            qb.push(", updated_at = NOW()");
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id);
        for scope in scopes {
            scope(&mut qb);
        }
        qb.push(" RETURNING *");
        let row = qb.build_query_as::<T>().fetch_optional(ex).await?;
        row.ok_or(AppError::NotFound(T::DOMAIN))
    }

    pub async fn delete_one<'e, E: PgExecutor<'e>>(
        &self,
        ex: E,
        id: Uuid,
        scopes: &[Scope],
    ) -> AppResult<bool> {
        let mut qb = QueryBuilder::new(format!("DELETE FROM {} WHERE id = ", T::TABLE));
        qb.push_bind(id);
        for scope in scopes {
            scope(&mut qb);
        }
        let result = qb.build().execute(ex).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_many<'e, E: PgExecutor<'e>>(
        &self,
        ex: E,
        scopes: &[Scope],
    ) -> AppResult<u64> {
        let mut qb = QueryBuilder::new(format!("DELETE FROM {} WHERE 1=1", T::TABLE));
        for scope in scopes {
            scope(&mut qb);
        }
        let result = qb.build().execute(ex).await?;
        Ok(result.rows_affected())
    }

    pub async fn find_one<'e, E: PgExecutor<'e>>(
        &self,
        ex: E,
        scopes: &[Scope],
    ) -> AppResult<Option<T>> {
        let mut qb = QueryBuilder::new(format!("SELECT * FROM {} WHERE 1=1", T::TABLE));
        for scope in scopes {
            scope(&mut qb);
        }
        qb.push(" LIMIT 1");
        Ok(qb.build_query_as::<T>().fetch_optional(ex).await?)
    }

    pub async fn find_by_id<'e, E: PgExecutor<'e>>(
        &self,
        ex: E,
        id: Uuid,
        scopes: &[Scope],
    ) -> AppResult<Option<T>> {
        let mut all = vec![scope_id(id)];
        all.extend(scopes.iter().cloned());
        self.find_one(ex, &all).await
    }

    pub async fn list<'e, E: PgExecutor<'e>>(
        &self,
        ex: E,
        scopes: &[Scope],
        order: Option<&OrderBy>,
        page: Page,
    ) -> AppResult<Vec<T>> {
        let mut qb = QueryBuilder::new(format!("SELECT * FROM {} WHERE 1=1", T::TABLE));
        for scope in scopes {
            scope(&mut qb);
        }
        match order {
            Some(order) => order(&mut qb),
            None => {
                qb.push(format!(" ORDER BY {}", T::DEFAULT_ORDER));
            }
        }
        qb.push(" LIMIT ");
        qb.push_bind(page.page_size);
        qb.push(" OFFSET ");
        qb.push_bind(page.offset());
        Ok(qb.build_query_as::<T>().fetch_all(ex).await?)
    }

    pub async fn count<'e, E: PgExecutor<'e>>(&self, ex: E, scopes: &[Scope]) -> AppResult<i64> {
        let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {} WHERE 1=1", T::TABLE));
        for scope in scopes {
            scope(&mut qb);
        }
        let row = qb.build().fetch_one(ex).await?;
        Ok(row.get::<i64, _>(0))
    }
}
