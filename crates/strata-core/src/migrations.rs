// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded database migrations.
//!
//! [`SqliteStore::connect`](crate::persistence::SqliteStore::connect) applies
//! them automatically. Applications that manage their own pool can run them
//! directly:
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:strata.db?mode=rwc").await?;
//! strata_core::migrations::run_sqlite(&pool).await?;
//! let store = SqliteStore::new(pool);
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with the node, link, group, log, checkpoint and lease tables.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
