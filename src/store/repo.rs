use std::marker::PhantomData;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgRow, Postgres};
use sqlx::query_builder::Separated;
use sqlx::{FromRow, QueryBuilder};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::page::{PageEnvelope, PageRequest};
use super::Scope;

/// key: entity-schema -> per-entity descriptor registered at startup
///
/// `orderable` is the whitelist for user-supplied order tokens;
/// `default_order` is trusted static SQL owned by the entity module.
#[derive(Debug)]
pub struct EntitySchema {
    pub table: &'static str,
    pub orderable: &'static [&'static str],
    pub searchable: &'static [&'static str],
    pub default_order: &'static str,
}

/// A value bound into a dynamically assembled query.
#[derive(Debug, Clone)]
pub enum Bind {
    Uuid(Uuid),
    OptUuid(Option<Uuid>),
    Text(String),
    OptText(Option<String>),
    Bool(bool),
    I32(i32),
    I64(i64),
    Decimal(Decimal),
    Date(NaiveDate),
    OptDate(Option<NaiveDate>),
    Timestamp(DateTime<Utc>),
    OptTimestamp(Option<DateTime<Utc>>),
}

impl Bind {
    fn push(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Bind::Uuid(v) => qb.push_bind(*v),
            Bind::OptUuid(v) => qb.push_bind(*v),
            Bind::Text(v) => qb.push_bind(v.clone()),
            Bind::OptText(v) => qb.push_bind(v.clone()),
            Bind::Bool(v) => qb.push_bind(*v),
            Bind::I32(v) => qb.push_bind(*v),
            Bind::I64(v) => qb.push_bind(*v),
            Bind::Decimal(v) => qb.push_bind(*v),
            Bind::Date(v) => qb.push_bind(*v),
            Bind::OptDate(v) => qb.push_bind(*v),
            Bind::Timestamp(v) => qb.push_bind(*v),
            Bind::OptTimestamp(v) => qb.push_bind(*v),
        };
    }

    fn push_separated(self, separated: &mut Separated<'_, '_, Postgres, &'static str>) {
        match self {
            Bind::Uuid(v) => separated.push_bind(v),
            Bind::OptUuid(v) => separated.push_bind(v),
            Bind::Text(v) => separated.push_bind(v),
            Bind::OptText(v) => separated.push_bind(v),
            Bind::Bool(v) => separated.push_bind(v),
            Bind::I32(v) => separated.push_bind(v),
            Bind::I64(v) => separated.push_bind(v),
            Bind::Decimal(v) => separated.push_bind(v),
            Bind::Date(v) => separated.push_bind(v),
            Bind::OptDate(v) => separated.push_bind(v),
            Bind::Timestamp(v) => separated.push_bind(v),
            Bind::OptTimestamp(v) => separated.push_bind(v),
        };
    }
}

/// Equality filter on a developer-named column.
#[derive(Debug, Clone)]
pub struct Filter {
    pub column: &'static str,
    pub value: Bind,
}

impl Filter {
    pub fn eq(column: &'static str, value: Bind) -> Self {
        Self { column, value }
    }
}

/// key: scoped-repository -> every operation takes the tenant scope set
#[derive(Clone)]
pub struct Repository<T> {
    pool: PgPool,
    schema: &'static EntitySchema,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Repository<T>
where
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    pub fn new(pool: PgPool, schema: &'static EntitySchema) -> Self {
        Self {
            pool,
            schema,
            _marker: PhantomData,
        }
    }

    pub fn schema(&self) -> &'static EntitySchema {
        self.schema
    }

    fn push_predicates(
        qb: &mut QueryBuilder<'_, Postgres>,
        scopes: &[Scope],
        filters: &[Filter],
    ) {
        for scope in scopes {
            qb.push(" AND ");
            qb.push(scope.column());
            qb.push(" = ");
            qb.push_bind(scope.value());
        }
        for filter in filters {
            qb.push(" AND ");
            qb.push(filter.column);
            qb.push(" = ");
            filter.value.push(qb);
        }
    }

    fn push_search(&self, qb: &mut QueryBuilder<'_, Postgres>, term: &str) {
        if self.schema.searchable.is_empty() {
            return;
        }
        let pattern = format!("%{term}%");
        qb.push(" AND (");
        for (i, column) in self.schema.searchable.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push(*column);
            qb.push(" ILIKE ");
            qb.push_bind(pattern.clone());
        }
        qb.push(")");
    }

    pub async fn find_one(&self, scopes: &[Scope], filters: &[Filter]) -> AppResult<T> {
        let mut qb = QueryBuilder::new(format!("SELECT * FROM {} WHERE TRUE", self.schema.table));
        Self::push_predicates(&mut qb, scopes, filters);
        qb.push(" LIMIT 1");
        let row = qb
            .build_query_as::<T>()
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::from)?;
        row.ok_or(AppError::not_found("tenant.not_found"))
    }

    pub async fn find_by_id(&self, id: Uuid, scopes: &[Scope]) -> AppResult<T> {
        self.find_one(scopes, &[Filter::eq("id", Bind::Uuid(id))])
            .await
    }

    pub async fn count(&self, scopes: &[Scope], filters: &[Filter]) -> AppResult<i64> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT COUNT(*) FROM {} WHERE TRUE",
            self.schema.table
        ));
        Self::push_predicates(&mut qb, scopes, filters);
        let count: (i64,) = qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(count.0)
    }

    pub async fn list(
        &self,
        scopes: &[Scope],
        filters: &[Filter],
        request: &PageRequest,
    ) -> AppResult<PageEnvelope<T>> {
        let search = request.search()?;
        let order = request.order(self.schema);

        let mut count_qb = QueryBuilder::new(format!(
            "SELECT COUNT(*) FROM {} WHERE TRUE",
            self.schema.table
        ));
        Self::push_predicates(&mut count_qb, scopes, filters);
        if let Some(term) = search.as_deref() {
            self.push_search(&mut count_qb, term);
        }
        let total: (i64,) = count_qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::from)?;
        let total = total.0;

        let mut qb = QueryBuilder::new(format!("SELECT * FROM {} WHERE TRUE", self.schema.table));
        Self::push_predicates(&mut qb, scopes, filters);
        if let Some(term) = search.as_deref() {
            self.push_search(&mut qb, term);
        }
        if !order.is_empty() {
            qb.push(" ORDER BY ");
            for (i, (column, desc)) in order.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                qb.push(*column);
                qb.push(if *desc { " DESC" } else { " ASC" });
            }
        } else if let (Some(term), Some(first)) =
            (search.as_deref(), self.schema.searchable.first())
        {
            // Relevance rank: earlier match in the primary searchable column
            // sorts first.
            qb.push(" ORDER BY position(lower(");
            qb.push_bind(term.to_lowercase());
            qb.push(format!(
                ") in lower({first})) ASC, {}",
                self.schema.default_order
            ));
        } else {
            qb.push(format!(" ORDER BY {}", self.schema.default_order));
        }
        qb.push(" LIMIT ");
        qb.push_bind(request.page_size());
        qb.push(" OFFSET ");
        qb.push_bind(request.offset());

        let items = qb
            .build_query_as::<T>()
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::from)?;

        Ok(PageEnvelope::new(
            items,
            request.page(),
            request.page_size(),
            total,
        ))
    }

    pub async fn create_one(&self, columns: Vec<(&'static str, Bind)>) -> AppResult<T> {
        let mut qb = QueryBuilder::new(format!("INSERT INTO {} (", self.schema.table));
        for (i, (name, _)) in columns.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(*name);
        }
        qb.push(") VALUES (");
        for (i, (_, value)) in columns.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            value.push(&mut qb);
        }
        qb.push(") RETURNING *");
        let row = qb
            .build_query_as::<T>()
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(row)
    }

    pub async fn create_many(
        &self,
        columns: &[&'static str],
        rows: Vec<Vec<Bind>>,
    ) -> AppResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            self.schema.table,
            columns.join(", ")
        ));
        qb.push_values(rows.into_iter(), |mut separated, row| {
            for value in row {
                value.push_separated(&mut separated);
            }
        });
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(result.rows_affected())
    }

    pub async fn update_one(
        &self,
        id: Uuid,
        scopes: &[Scope],
        columns: Vec<(&'static str, Bind)>,
    ) -> AppResult<T> {
        let mut qb = QueryBuilder::new(format!("UPDATE {} SET ", self.schema.table));
        for (i, (name, value)) in columns.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(*name);
            qb.push(" = ");
            value.push(&mut qb);
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id);
        Self::push_predicates(&mut qb, scopes, &[]);
        qb.push(" RETURNING *");
        let row = qb
            .build_query_as::<T>()
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::from)?;
        row.ok_or(AppError::not_found("tenant.not_found"))
    }

    /// Partial update: only pairs with a value are applied.
    pub async fn patch_one(
        &self,
        id: Uuid,
        scopes: &[Scope],
        columns: Vec<(&'static str, Option<Bind>)>,
    ) -> AppResult<T> {
        let set: Vec<(&'static str, Bind)> = columns
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect();
        if set.is_empty() {
            return self.find_by_id(id, scopes).await;
        }
        self.update_one(id, scopes, set).await
    }

    pub async fn delete_one(&self, id: Uuid, scopes: &[Scope]) -> AppResult<()> {
        let mut qb = QueryBuilder::new(format!("DELETE FROM {} WHERE id = ", self.schema.table));
        qb.push_bind(id);
        Self::push_predicates(&mut qb, scopes, &[]);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("tenant.not_found"));
        }
        Ok(())
    }

    pub async fn delete_many(&self, scopes: &[Scope], filters: &[Filter]) -> AppResult<u64> {
        let mut qb = QueryBuilder::new(format!("DELETE FROM {} WHERE TRUE", self.schema.table));
        Self::push_predicates(&mut qb, scopes, filters);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(result.rows_affected())
    }
}
