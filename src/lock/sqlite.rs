//! SQLite lease lock on the `scheduler_lock` table.

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::SqlitePool;
use tracing::debug;

use super::{DistributedLock, LockGuard, LockLease, Result};
use crate::storage::format_timestamp;
use crate::storage::schema::SchedulerLocks;

/// Lease lock backed by the service database.
///
/// Every instance sharing the database competes for the same rows.
#[derive(Clone)]
pub struct SqliteLock {
    pool: SqlitePool,
}

impl SqliteLock {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for SqliteLock {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        lease: LockLease,
    ) -> Result<Option<LockGuard>> {
        let now = Utc::now();
        let until = now + lease.at_most_chrono();
        let now_str = format_timestamp(now);
        let until_str = format_timestamp(until);

        let insert = Query::insert()
            .into_table(SchedulerLocks::Table)
            .columns([
                SchedulerLocks::Name,
                SchedulerLocks::LockUntil,
                SchedulerLocks::LockedAt,
                SchedulerLocks::LockedBy,
            ])
            .values_panic([
                name.into(),
                until_str.clone().into(),
                now_str.clone().into(),
                owner.into(),
            ])
            .on_conflict(OnConflict::column(SchedulerLocks::Name).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);

        let mut acquired = sqlx::query(&insert).execute(&self.pool).await?.rows_affected() == 1;

        if !acquired {
            let update = Query::update()
                .table(SchedulerLocks::Table)
                .values([
                    (SchedulerLocks::LockUntil, until_str.into()),
                    (SchedulerLocks::LockedAt, now_str.clone().into()),
                    (SchedulerLocks::LockedBy, owner.into()),
                ])
                .and_where(Expr::col(SchedulerLocks::Name).eq(name))
                .and_where(Expr::col(SchedulerLocks::LockUntil).lte(now_str))
                .to_string(SqliteQueryBuilder);

            acquired = sqlx::query(&update).execute(&self.pool).await?.rows_affected() == 1;
        }

        if !acquired {
            debug!(lock = %name, owner = %owner, "Lock held elsewhere");
            return Ok(None);
        }

        Ok(Some(LockGuard {
            name: name.to_string(),
            owner: owner.to_string(),
            lease,
            locked_at: now,
            lock_until: until,
        }))
    }

    async fn renew(&self, guard: &mut LockGuard) -> Result<bool> {
        let now = Utc::now();
        let until = now + guard.lease.at_most_chrono();

        let query = Query::update()
            .table(SchedulerLocks::Table)
            .values([(SchedulerLocks::LockUntil, format_timestamp(until).into())])
            .and_where(Expr::col(SchedulerLocks::Name).eq(guard.name.as_str()))
            .and_where(Expr::col(SchedulerLocks::LockedBy).eq(guard.owner.as_str()))
            .and_where(Expr::col(SchedulerLocks::LockedAt).eq(format_timestamp(guard.locked_at)))
            .and_where(Expr::col(SchedulerLocks::LockUntil).gt(format_timestamp(now)))
            .to_string(SqliteQueryBuilder);

        let renewed = sqlx::query(&query).execute(&self.pool).await?.rows_affected() == 1;
        if renewed {
            guard.lock_until = until;
        }
        Ok(renewed)
    }

    async fn release(&self, guard: LockGuard) -> Result<()> {
        let earliest = guard.locked_at + guard.lease.at_least_chrono();
        let until = std::cmp::max(Utc::now(), earliest);

        let query = Query::update()
            .table(SchedulerLocks::Table)
            .values([(SchedulerLocks::LockUntil, format_timestamp(until).into())])
            .and_where(Expr::col(SchedulerLocks::Name).eq(guard.name.as_str()))
            .and_where(Expr::col(SchedulerLocks::LockedBy).eq(guard.owner.as_str()))
            .and_where(Expr::col(SchedulerLocks::LockedAt).eq(format_timestamp(guard.locked_at)))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }
}
