use std::marker::PhantomData;
use std::sync::Arc;

use sqlx::postgres::PgQueryResult;
use sqlx::{Pool, Postgres, Transaction};

use crate::store::postgres::{InnerPgEventStore, PgEventStore, Statements};
use crate::{Aggregate, Error};

/// Struct used to build a brand new [`PgEventStore`].
pub struct PgEventStoreBuilder<A>
where
    A: Aggregate,
{
    pool: Pool<Postgres>,
    statements: Statements,
    run_migrations: bool,
    _aggregate: PhantomData<A>,
}

impl<A> PgEventStoreBuilder<A>
where
    A: Aggregate,
{
    /// Creates a new instance of a [`PgEventStoreBuilder`].
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            statements: Statements::new::<A>(),
            run_migrations: true,
            _aggregate: PhantomData,
        }
    }

    /// Calling this function the caller avoid running migrations. It is recommend to run migrations
    /// at least once per store per startup.
    pub fn without_running_migrations(mut self) -> Self {
        self.run_migrations = false;
        self
    }

    /// Creates the events table and its `(aggregate_id, version)` unique index, atomically, unless
    /// `run_migrations` was explicitly set to false. Migrations should be run only at application
    /// startup.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if there's an error running the migrations.
    #[tracing::instrument(skip_all, fields(table = self.statements.table_name()), err)]
    pub async fn try_build(self) -> Result<PgEventStore<A>, Error> {
        if self.run_migrations {
            let mut transaction: Transaction<Postgres> = self.pool.begin().await?;

            for migration in [self.statements.create_table(), self.statements.create_index()] {
                let _: PgQueryResult = sqlx::query(migration).execute(&mut *transaction).await?;
            }

            transaction.commit().await?;
            tracing::debug!("event store migrations applied");
        }

        Ok(PgEventStore {
            inner: Arc::new(InnerPgEventStore {
                pool: self.pool,
                statements: self.statements,
            }),
            _aggregate: PhantomData,
        })
    }
}
