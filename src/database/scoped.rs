use serde_json::Value;
use sqlx::{self, postgres::PgArguments, FromRow, PgConnection, PgPool, Row};

use crate::context::TenantContext;
use crate::database::binding::with_bound_conn;
use crate::database::manager::DatabaseManager;
use crate::database::policy::is_tenant_table;
use crate::error::IsolationError;

/// Application-level query construction for tenant-scoped tables.
///
/// This is the second enforcement layer, deliberately redundant with the row
/// policies: every statement built here carries `WHERE org_id = $1` bound
/// from the `TenantContext`, so isolation survives either layer failing
/// alone. Construction requires a context; there is no way to build a query
/// against a tenant-scoped table without one.
#[derive(Debug)]
pub struct ScopedQuery<T> {
    table: String,
    ctx: TenantContext,
    conditions: Vec<(String, Value)>,
    limit: Option<i64>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T> ScopedQuery<T>
where
    T: for<'r> FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
{
    pub fn new(table: impl Into<String>, ctx: &TenantContext) -> Result<Self, IsolationError> {
        let table = table.into();
        if !is_tenant_table(&table) {
            return Err(IsolationError::UnknownTable(table));
        }
        Ok(Self {
            table,
            ctx: ctx.clone(),
            conditions: Vec::new(),
            limit: None,
            _phantom: std::marker::PhantomData,
        })
    }

    /// AND an extra equality predicate onto the query. The org predicate is
    /// structural and cannot be replaced by this.
    pub fn filter(mut self, column: impl Into<String>, value: Value) -> Result<Self, IsolationError> {
        let column = column.into();
        if !is_valid_column(&column) {
            return Err(IsolationError::Query(format!("invalid column name: {}", column)));
        }
        if column == "org_id" {
            // The org predicate comes from the context, never from callers
            return Err(IsolationError::Query(
                "org_id is bound from the tenant context and cannot be filtered explicitly".to_string(),
            ));
        }
        self.conditions.push((column, value));
        Ok(self)
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn where_clause(&self) -> String {
        let mut clause = String::from("WHERE org_id = $1");
        for (i, (column, _)) in self.conditions.iter().enumerate() {
            clause.push_str(&format!(
                " AND {} = ${}",
                DatabaseManager::quote_identifier(column),
                i + 2
            ));
        }
        clause
    }

    fn select_sql(&self) -> String {
        let mut sql = format!(
            "SELECT * FROM {} {}",
            DatabaseManager::quote_identifier(&self.table),
            self.where_clause()
        );
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        sql
    }

    fn count_sql(&self) -> String {
        format!(
            "SELECT COUNT(*) AS count FROM {} {}",
            DatabaseManager::quote_identifier(&self.table),
            self.where_clause()
        )
    }

    pub async fn fetch_all(&self, conn: &mut PgConnection) -> Result<Vec<T>, IsolationError> {
        let sql = self.select_sql();
        let mut q = sqlx::query_as::<_, T>(&sql).bind(self.ctx.org_id());
        for (_, value) in &self.conditions {
            q = bind_value_as(q, value);
        }
        Ok(q.fetch_all(conn).await?)
    }

    pub async fn fetch_optional(&self, conn: &mut PgConnection) -> Result<Option<T>, IsolationError> {
        let sql = self.select_sql();
        let mut q = sqlx::query_as::<_, T>(&sql).bind(self.ctx.org_id());
        for (_, value) in &self.conditions {
            q = bind_value_as(q, value);
        }
        Ok(q.fetch_optional(conn).await?)
    }

    pub async fn fetch_one(&self, conn: &mut PgConnection) -> Result<T, IsolationError> {
        let sql = self.select_sql();
        let mut q = sqlx::query_as::<_, T>(&sql).bind(self.ctx.org_id());
        for (_, value) in &self.conditions {
            q = bind_value_as(q, value);
        }
        Ok(q.fetch_one(conn).await?)
    }

    pub async fn count(&self, conn: &mut PgConnection) -> Result<i64, IsolationError> {
        let sql = self.count_sql();
        let mut q = sqlx::query(&sql).bind(self.ctx.org_id());
        for (_, value) in &self.conditions {
            q = bind_value(q, value);
        }
        let row = q.fetch_one(conn).await?;
        let count: i64 = row.try_get("count")?;
        Ok(count)
    }

    pub async fn delete(&self, conn: &mut PgConnection) -> Result<u64, IsolationError> {
        let sql = format!(
            "DELETE FROM {} {}",
            DatabaseManager::quote_identifier(&self.table),
            self.where_clause()
        );
        let mut q = sqlx::query(&sql).bind(self.ctx.org_id());
        for (_, value) in &self.conditions {
            q = bind_value(q, value);
        }
        Ok(q.execute(conn).await?.rows_affected())
    }
}

/// Insert a row into a tenant-scoped table. The `org_id` column is injected
/// from the context; callers cannot supply it.
pub async fn scoped_insert(
    conn: &mut PgConnection,
    table: &str,
    ctx: &TenantContext,
    columns: &[(&str, Value)],
) -> Result<u64, IsolationError> {
    if !is_tenant_table(table) {
        return Err(IsolationError::UnknownTable(table.to_string()));
    }
    let mut names = vec!["org_id".to_string()];
    let mut placeholders = vec!["$1".to_string()];
    for (i, (column, _)) in columns.iter().enumerate() {
        if !is_valid_column(column) {
            return Err(IsolationError::Query(format!("invalid column name: {}", column)));
        }
        if *column == "org_id" {
            return Err(IsolationError::Query(
                "org_id is bound from the tenant context and cannot be supplied".to_string(),
            ));
        }
        names.push(DatabaseManager::quote_identifier(column));
        placeholders.push(format!("${}", i + 2));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        DatabaseManager::quote_identifier(table),
        names.join(", "),
        placeholders.join(", ")
    );

    let mut q = sqlx::query(&sql).bind(ctx.org_id());
    for (_, value) in columns {
        q = bind_value(q, value);
    }
    Ok(q.execute(conn).await?.rows_affected())
}

/// Repository over one tenant-scoped table, the shape business CRUD code
/// consumes. Holds the context it was constructed with and routes every
/// statement through `with_bound_conn`, so both enforcement layers apply to
/// every call.
pub struct ScopedRepository<T> {
    table: String,
    ctx: TenantContext,
    _phantom: std::marker::PhantomData<T>,
}

impl<T> ScopedRepository<T>
where
    T: for<'r> FromRow<'r, sqlx::postgres::PgRow> + Send + Sync + Unpin + 'static,
{
    pub fn new(table: impl Into<String>, ctx: &TenantContext) -> Result<Self, IsolationError> {
        let table = table.into();
        if !is_tenant_table(&table) {
            return Err(IsolationError::UnknownTable(table));
        }
        Ok(Self { table, ctx: ctx.clone(), _phantom: std::marker::PhantomData })
    }

    pub async fn select_all(&self, pool: &PgPool) -> Result<Vec<T>, IsolationError> {
        let query = ScopedQuery::<T>::new(&self.table, &self.ctx)?;
        with_bound_conn(pool, &self.ctx, move |tx| {
            Box::pin(async move { query.fetch_all(&mut **tx).await })
        })
        .await
    }

    pub async fn select_one(&self, column: &str, value: Value, pool: &PgPool) -> Result<Option<T>, IsolationError> {
        let query = ScopedQuery::<T>::new(&self.table, &self.ctx)?.filter(column, value)?;
        with_bound_conn(pool, &self.ctx, move |tx| {
            Box::pin(async move { query.fetch_optional(&mut **tx).await })
        })
        .await
    }

    pub async fn count(&self, pool: &PgPool) -> Result<i64, IsolationError> {
        let query = ScopedQuery::<T>::new(&self.table, &self.ctx)?;
        with_bound_conn(pool, &self.ctx, move |tx| {
            Box::pin(async move { query.count(&mut **tx).await })
        })
        .await
    }

    pub async fn insert(&self, columns: Vec<(&'static str, Value)>, pool: &PgPool) -> Result<u64, IsolationError> {
        let table = self.table.clone();
        let ctx = self.ctx.clone();
        with_bound_conn(pool, &self.ctx, move |tx| {
            Box::pin(async move { scoped_insert(&mut **tx, &table, &ctx, &columns).await })
        })
        .await
    }

    pub async fn delete(&self, column: &str, value: Value, pool: &PgPool) -> Result<u64, IsolationError> {
        let query = ScopedQuery::<T>::new(&self.table, &self.ctx)?.filter(column, value)?;
        with_bound_conn(pool, &self.ctx, move |tx| {
            Box::pin(async move { query.delete(&mut **tx).await })
        })
        .await
    }
}

fn is_valid_column(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn bind_value<'q>(
    q: sqlx::query::Query<'q, sqlx::Postgres, PgArguments>,
    v: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, PgArguments> {
    match v {
        Value::Null => {
            let none: Option<String> = None;
            q.bind(none)
        }
        Value::Bool(b) => q.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(n.to_string())
            }
        }
        Value::String(s) => q.bind(s),
        Value::Array(_) | Value::Object(_) => q.bind(v.clone()), // JSONB
    }
}

fn bind_value_as<'q, O>(
    q: sqlx::query::QueryAs<'q, sqlx::Postgres, O, PgArguments>,
    v: &'q Value,
) -> sqlx::query::QueryAs<'q, sqlx::Postgres, O, PgArguments>
where
    O: for<'r> FromRow<'r, sqlx::postgres::PgRow>,
{
    match v {
        Value::Null => {
            let none: Option<String> = None;
            q.bind(none)
        }
        Value::Bool(b) => q.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(n.to_string())
            }
        }
        Value::String(s) => q.bind(s),
        Value::Array(_) | Value::Object(_) => q.bind(v.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Session;
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Debug, sqlx::FromRow)]
    struct AnyRow {
        #[allow(dead_code)]
        id: Uuid,
    }

    fn ctx() -> TenantContext {
        let org = Uuid::new_v4();
        TenantContext::resolve(&Session::new(Uuid::new_v4(), vec![org])).unwrap()
    }

    #[test]
    fn queries_require_a_tenant_scoped_table() {
        let ctx = ctx();
        assert!(ScopedQuery::<AnyRow>::new("customers", &ctx).is_ok());
        assert!(matches!(
            ScopedQuery::<AnyRow>::new("organizations", &ctx),
            Err(IsolationError::UnknownTable(_))
        ));
        assert!(matches!(
            ScopedQuery::<AnyRow>::new("customers; DROP TABLE users", &ctx),
            Err(IsolationError::UnknownTable(_))
        ));
    }

    #[test]
    fn org_predicate_is_always_first() {
        let query = ScopedQuery::<AnyRow>::new("jobs", &ctx()).unwrap();
        assert_eq!(query.select_sql(), "SELECT * FROM \"jobs\" WHERE org_id = $1");
        assert_eq!(
            query.count_sql(),
            "SELECT COUNT(*) AS count FROM \"jobs\" WHERE org_id = $1"
        );
    }

    #[test]
    fn extra_filters_and_onto_the_org_predicate() {
        let query = ScopedQuery::<AnyRow>::new("invoices", &ctx())
            .unwrap()
            .filter("status", json!("open"))
            .unwrap()
            .filter("customer_id", json!("abc"))
            .unwrap()
            .limit(10);
        assert_eq!(
            query.select_sql(),
            "SELECT * FROM \"invoices\" WHERE org_id = $1 AND \"status\" = $2 AND \"customer_id\" = $3 LIMIT 10"
        );
    }

    #[test]
    fn callers_cannot_supply_their_own_org_filter() {
        let err = ScopedQuery::<AnyRow>::new("customers", &ctx())
            .unwrap()
            .filter("org_id", json!("11111111-1111-1111-1111-111111111111"))
            .unwrap_err();
        assert!(matches!(err, IsolationError::Query(_)));
    }

    #[test]
    fn rejects_malformed_column_names() {
        let query = ScopedQuery::<AnyRow>::new("customers", &ctx()).unwrap();
        assert!(query.filter("name; --", json!("x")).is_err());

        let query = ScopedQuery::<AnyRow>::new("customers", &ctx()).unwrap();
        assert!(query.filter("Name", json!("x")).is_err());
    }

    #[test]
    fn repository_requires_a_tenant_scoped_table() {
        let ctx = ctx();
        assert!(ScopedRepository::<AnyRow>::new("equipment", &ctx).is_ok());
        assert!(ScopedRepository::<AnyRow>::new("pg_class", &ctx).is_err());
    }
}
