use crate::Aggregate;

/// Builds a statement for the `<aggregate>_events` table of `A`.
macro_rules! statement {
    ($sql:literal, $ty:ty $(,)?) => {{
        format!($sql, format!("{}_events", <$ty as Aggregate>::NAME))
    }};
}

#[derive(Clone, Debug)]
pub struct Statements {
    table_name: String,
    create_table: String,
    create_index: String,
    select_by_aggregate_id: String,
    select_max_version: String,
    select_aggregate_ids: String,
    lock_aggregate: String,
    insert: String,
}

impl Statements {
    pub fn new<A: Aggregate>() -> Self {
        Self {
            table_name: format!("{}_events", A::NAME),
            create_table: statement!(
                r#"CREATE TABLE IF NOT EXISTS {0}
                (
                  id uuid PRIMARY KEY NOT NULL,
                  aggregate_id TEXT NOT NULL,
                  aggregate_type TEXT NOT NULL,
                  version BIGINT NOT NULL,
                  payload jsonb NOT NULL,
                  occurred_on TIMESTAMPTZ NOT NULL DEFAULT current_timestamp,
                  metadata jsonb NOT NULL DEFAULT '{{}}'
                )"#,
                A
            ),
            create_index: statement!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {0}_aggregate_id_version ON {0}(aggregate_id, version)",
                A
            ),
            select_by_aggregate_id: statement!(
                "SELECT * FROM {0} WHERE aggregate_id = $1 ORDER BY version ASC",
                A
            ),
            select_max_version: statement!("SELECT MAX(version) FROM {0} WHERE aggregate_id = $1", A),
            select_aggregate_ids: statement!("SELECT DISTINCT aggregate_id FROM {0} ORDER BY aggregate_id", A),
            lock_aggregate: "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))".to_string(),
            insert: statement!(
                r#"INSERT INTO {0}
                (id, aggregate_id, aggregate_type, version, payload, occurred_on, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
                A
            ),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn create_table(&self) -> &str {
        &self.create_table
    }

    pub fn create_index(&self) -> &str {
        &self.create_index
    }

    pub fn by_aggregate_id(&self) -> &str {
        &self.select_by_aggregate_id
    }

    pub fn max_version(&self) -> &str {
        &self.select_max_version
    }

    pub fn aggregate_ids(&self) -> &str {
        &self.select_aggregate_ids
    }

    /// Transaction-scoped advisory lock on one aggregate id.
    pub fn lock_aggregate(&self) -> &str {
        &self.lock_aggregate
    }

    pub fn insert(&self) -> &str {
        &self.insert
    }
}
