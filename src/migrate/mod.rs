//! Embedded ClickHouse schema migrations for the flow table.

use anyhow::{bail, Context, Result};
use clickhouse_rs::{ClientHandle, Pool};

/// One schema version with its forward and rollback SQL.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_flows.up.sql"),
    down_sql: include_str!("sql/001_flows.down.sql"),
}];

const VERSION_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version Int64,
    dirty UInt8,
    sequence UInt64
) ENGINE = TinyLog";

/// Applies and rolls back schema migrations.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// Migration runner tracking versions in a `schema_migrations` table.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn handle(&self) -> Result<ClientHandle> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migrations")?;
        handle
            .execute(VERSION_TABLE_DDL)
            .await
            .context("creating schema_migrations table")?;
        Ok(handle)
    }

    async fn version(handle: &mut ClientHandle) -> Result<(u32, bool)> {
        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        let Some(row) = block.rows().next() else {
            return Ok((0, false));
        };
        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
        let version = u32::try_from(version).context("migration version out of range")?;

        Ok((version, dirty != 0))
    }

    async fn set_version(handle: &mut ClientHandle, version: u32, dirty: bool) -> Result<()> {
        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        if version == 0 {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {}, 1)",
            u8::from(dirty)
        );
        handle
            .execute(sql.as_str())
            .await
            .context("recording migration version")?;

        Ok(())
    }

    async fn apply(handle: &mut ClientHandle, version: u32, sql: &str) -> Result<()> {
        for statement in split_statements(sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("migration {version}: executing {preview}...")
            })?;
        }
        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        let mut handle = self.handle().await?;
        let (current, dirty) = Self::version(&mut handle).await?;

        if dirty {
            bail!("migration version {current} is dirty, manual intervention required");
        }

        let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
        if pending.is_empty() {
            tracing::info!(version = current, "schema is up to date");
            return Ok(());
        }

        for migration in &pending {
            tracing::info!(version = migration.version, "applying migration");
            Self::set_version(&mut handle, migration.version, true).await?;
            Self::apply(&mut handle, migration.version, migration.up_sql).await?;
            Self::set_version(&mut handle, migration.version, false).await?;
        }

        tracing::info!(from = current, applied = pending.len(), "migrations completed");

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        let mut handle = self.handle().await?;
        let (current, _) = Self::version(&mut handle).await?;

        if current == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current)
            .with_context(|| format!("migration version {current} not found"))?;
        let previous = previous_version(current);

        tracing::info!(version = current, "rolling back migration");
        Self::set_version(&mut handle, current, true).await?;
        Self::apply(&mut handle, current, migration.down_sql).await?;
        Self::set_version(&mut handle, previous, false).await?;
        tracing::info!(version = previous, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        let mut handle = self.handle().await?;
        Self::version(&mut handle).await
    }
}

fn previous_version(version: u32) -> u32 {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < version)
        .max()
        .unwrap_or(0)
}

/// Splits SQL text into statements on semicolons, dropping empty ones.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::clickhouse::{FLOWS_TABLE, FLOW_COLUMNS};

    #[test]
    fn test_split_statements() {
        let stmts = split_statements("SELECT 1;\n\n  SELECT 2;;; ");
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2"]);
        assert!(split_statements("  ").is_empty());
    }

    #[test]
    fn test_migrations_ordered_and_reversible() {
        for window in MIGRATIONS.windows(2) {
            assert!(window[0].version < window[1].version);
        }
        for m in MIGRATIONS {
            assert!(!split_statements(m.up_sql).is_empty());
            assert!(!split_statements(m.down_sql).is_empty());
        }
        assert_eq!(previous_version(1), 0);
    }

    #[test]
    fn test_flow_table_has_every_insert_column() {
        let create = MIGRATIONS[0].up_sql;
        assert!(create.contains(&format!("CREATE TABLE IF NOT EXISTS {FLOWS_TABLE}")));
        for column in FLOW_COLUMNS {
            assert!(
                create.contains(&format!("    {column} ")),
                "column {column} missing from flow table"
            );
        }
    }
}
