#![allow(dead_code)]

use rusqlite::{params, OptionalExtension};
use sea_query::{Expr, Func, Iden, Order, Query};
use tempfile::{tempdir, TempDir};

use tally_store::{
    ColumnType, Entity, EntitySource, EntityType, MetricOptions, MetricValue, MetricsConfig,
    MetricsContext, MetricsResult, QueryScope, SqliteStore, StoreBinding, TallyConfig,
};

pub const METRIC_TABLE: &str = "user_metrics";

#[derive(Iden)]
pub enum Users {
    Table,
    Id,
    Name,
    IdentityId,
}

#[derive(Iden)]
pub enum Pets {
    Table,
    Id,
    UserId,
    Age,
    Weight,
}

#[derive(Iden)]
pub enum Identities {
    Table,
    Id,
}

#[derive(Iden)]
pub enum Activities {
    Table,
    Id,
    ActorId,
}

pub struct Fixture {
    _dir: TempDir,
    pub store: SqliteStore,
}

pub fn fixture() -> Fixture {
    let dir = tempdir().expect("tempdir");
    let config = TallyConfig::default_sqlite("metrics.sqlite");
    let store = SqliteStore::connect(&config, dir.path()).expect("store");
    store
        .with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE users (
                    id INTEGER PRIMARY KEY,
                    name TEXT,
                    identity_id INTEGER
                 );
                 CREATE TABLE pets (
                    id INTEGER PRIMARY KEY,
                    name TEXT,
                    type TEXT,
                    user_id INTEGER,
                    age INTEGER,
                    weight INTEGER
                 );
                 CREATE TABLE identities (
                    id INTEGER PRIMARY KEY,
                    thoughts TEXT
                 );
                 CREATE TABLE activities (
                    id INTEGER PRIMARY KEY,
                    actor_id INTEGER,
                    type TEXT
                 );",
            )
        })
        .expect("schema");
    Fixture { _dir: dir, store }
}

pub fn quiet_context(store: &SqliteStore) -> MetricsContext<'_, SqliteStore> {
    MetricsContext::new(store).with_config(MetricsConfig::quiet())
}

#[derive(Clone, Debug, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: Option<String>,
    pub identity_id: Option<i64>,
    persisted_name: Option<String>,
}

impl User {
    fn loaded(id: i64, name: Option<String>, identity_id: Option<i64>) -> Self {
        Self {
            id,
            persisted_name: name.clone(),
            name,
            identity_id,
        }
    }

    pub fn create(store: &SqliteStore, name: Option<&str>, identity_id: Option<i64>) -> Self {
        let id = store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO users (name, identity_id) VALUES (?1, ?2)",
                    params![name, identity_id],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .expect("insert user");
        Self::loaded(id, name.map(str::to_string), identity_id)
    }

    pub fn find_by_name(store: &SqliteStore, name: &str) -> Option<Self> {
        store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT id, name, identity_id FROM users WHERE name = ?1 ORDER BY id LIMIT 1",
                    [name],
                    |row| Ok(Self::loaded(row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
            })
            .expect("find user")
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    pub fn save(&mut self, store: &SqliteStore) -> MetricsResult<()> {
        store.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET name = ?1, identity_id = ?2 WHERE id = ?3",
                params![self.name, self.identity_id, self.id],
            )
        })?;
        self.persisted_name = self.name.clone();
        Ok(())
    }
}

impl Entity for User {
    fn id(&self) -> i64 {
        self.id
    }

    fn has_pending_changes(&self) -> bool {
        self.name != self.persisted_name
    }
}

pub fn create_identity(store: &SqliteStore, thoughts: &str) -> i64 {
    store
        .with_conn(|conn| {
            conn.execute("INSERT INTO identities (thoughts) VALUES (?1)", [thoughts])?;
            Ok(conn.last_insert_rowid())
        })
        .expect("insert identity")
}

pub fn create_pet(store: &SqliteStore, user_id: i64, age: i64, weight: i64) -> i64 {
    store
        .with_conn(|conn| {
            conn.execute(
                "INSERT INTO pets (user_id, age, weight) VALUES (?1, ?2, ?3)",
                params![user_id, age, weight],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .expect("insert pet")
}

pub fn create_activity(store: &SqliteStore, actor_id: i64, kind: &str) {
    store
        .with_conn(|conn| {
            conn.execute(
                "INSERT INTO activities (actor_id, type) VALUES (?1, ?2)",
                params![actor_id, kind],
            )
        })
        .expect("insert activity");
}

/// Value of `column` in the metric store row of user `id`.
pub fn stored(store: &SqliteStore, column: &str, id: i64) -> MetricValue {
    store.lookup(METRIC_TABLE, column, id).expect("stored value")
}

pub fn metric_rows(store: &SqliteStore) -> i64 {
    store
        .with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM user_metrics", [], |row| row.get(0))
        })
        .expect("count metric rows")
}

pub fn column_names(store: &SqliteStore, table: &str) -> Vec<String> {
    use tally_store::SchemaInspector;

    store.refresh_columns(table);
    store
        .columns(table)
        .expect("columns")
        .into_iter()
        .map(|column| column.name)
        .collect()
}

pub fn name_length(user: &User, _scope: &dyn QueryScope) -> MetricsResult<MetricValue> {
    let length = user.name.as_deref().map_or(0, |name| name.chars().count());
    Ok(MetricValue::Integer(length as i64))
}

pub fn pets_count(user: &User, scope: &dyn QueryScope) -> MetricsResult<MetricValue> {
    scope.fetch_value(
        &Query::select()
            .expr(Func::count(Expr::col(Pets::Id)))
            .from(Pets::Table)
            .and_where(Expr::col(Pets::UserId).eq(user.id))
            .to_owned(),
    )
}

pub fn average_pet_weight(user: &User, scope: &dyn QueryScope) -> MetricsResult<MetricValue> {
    scope.fetch_value(
        &Query::select()
            .expr(Func::avg(Expr::col(Pets::Weight)))
            .from(Pets::Table)
            .and_where(Expr::col(Pets::UserId).eq(user.id))
            .to_owned(),
    )
}

pub fn sent_activities(user: &User, scope: &dyn QueryScope) -> MetricsResult<MetricValue> {
    scope.fetch_value(
        &Query::select()
            .expr(Func::count(Expr::col((Activities::Table, Activities::Id))))
            .from(Activities::Table)
            .inner_join(
                Identities::Table,
                Expr::col((Identities::Table, Identities::Id))
                    .equals((Activities::Table, Activities::ActorId)),
            )
            .inner_join(
                Users::Table,
                Expr::col((Users::Table, Users::IdentityId))
                    .equals((Identities::Table, Identities::Id)),
            )
            .and_where(Expr::col((Users::Table, Users::Id)).eq(user.id))
            .to_owned(),
    )
}

/// Weight of the user's oldest pet, fetched alongside its age. Fine per row,
/// but the two-column select cannot serve as a scalar subquery.
pub fn first_pet_weight(user: &User, scope: &dyn QueryScope) -> MetricsResult<MetricValue> {
    scope.fetch_value(
        &Query::select()
            .column(Pets::Weight)
            .column(Pets::Age)
            .from(Pets::Table)
            .and_where(Expr::col(Pets::UserId).eq(user.id))
            .order_by(Pets::Id, Order::Asc)
            .limit(1)
            .to_owned(),
    )
}

pub fn users_type() -> EntityType<User> {
    let mut users = EntityType::new("User", StoreBinding::companion(METRIC_TABLE));
    users.metric("name_length", MetricOptions::default(), name_length);
    users.metric("pets_count", MetricOptions::default(), pets_count);
    users.metric(
        "average_pet_weight",
        MetricOptions::default().column_type(ColumnType::Float),
        average_pet_weight,
    );
    users.metric("sent_activities", MetricOptions::default(), sent_activities);
    users
}

/// Users in id order, loaded in keyset pages.
pub struct UserSource<'a> {
    pub store: &'a SqliteStore,
}

impl UserSource<'_> {
    fn page(&self, after: i64, limit: usize) -> MetricsResult<Vec<User>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, identity_id FROM users WHERE id > ?1 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![after, limit], |row| {
                Ok(User::loaded(row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let users = rows.collect::<rusqlite::Result<Vec<_>>>();
            users
        })
    }
}

impl EntitySource<User> for UserSource<'_> {
    fn count(&self) -> MetricsResult<u64> {
        let count: i64 = self
            .store
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0)))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn first(&self) -> MetricsResult<Option<User>> {
        Ok(self.page(i64::MIN, 1)?.into_iter().next())
    }

    fn for_each_batch(
        &self,
        batch_size: usize,
        f: &mut dyn FnMut(Vec<User>) -> MetricsResult<()>,
    ) -> MetricsResult<()> {
        let mut after = i64::MIN;
        loop {
            let batch = self.page(after, batch_size)?;
            let Some(last) = batch.last() else {
                return Ok(());
            };
            after = last.id;
            f(batch)?;
        }
    }
}
