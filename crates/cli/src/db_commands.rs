use {
    anyhow::Context,
    clap::Subcommand,
    keyward_config::KeywardConfig,
    sqlx::{SqlitePool, sqlite::SqlitePoolOptions},
    tracing::info,
};

#[derive(Subcommand)]
pub enum DbAction {
    /// Create or upgrade the key and audit tables.
    Migrate,
    /// Print recent audit events, newest first.
    Audit {
        /// Only events for this tenant.
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

pub async fn handle_db(config: &KeywardConfig, action: DbAction) -> anyhow::Result<()> {
    match action {
        DbAction::Migrate => {
            run_migrations(config).await?;
            println!("migrations applied to {}", config.store.database_url);
            Ok(())
        },
        DbAction::Audit { tenant, limit } => print_audit(config, tenant.as_deref(), limit).await,
    }
}

async fn connect(config: &KeywardConfig) -> anyhow::Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&config.store.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.store.database_url))
}

async fn run_migrations(config: &KeywardConfig) -> anyhow::Result<()> {
    let pool = connect(config).await?;
    keyward_keys::run_migrations(&pool).await?;
    info!("database migrations complete");
    pool.close().await;
    Ok(())
}

type AuditRow = (
    i64,
    String,
    String,
    Option<String>,
    Option<i64>,
    String,
    Option<String>,
);

async fn print_audit(config: &KeywardConfig, tenant: Option<&str>, limit: u32) -> anyhow::Result<()> {
    let pool = connect(config).await?;
    keyward_keys::run_migrations(&pool).await?;

    let rows: Vec<AuditRow> = match tenant {
        Some(tenant) => {
            sqlx::query_as(
                "SELECT timestamp_ms, tenant_id, operation, key_id, version, outcome, error_kind
                 FROM key_audit_log WHERE tenant_id = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(tenant)
            .bind(i64::from(limit))
            .fetch_all(&pool)
            .await?
        },
        None => {
            sqlx::query_as(
                "SELECT timestamp_ms, tenant_id, operation, key_id, version, outcome, error_kind
                 FROM key_audit_log ORDER BY id DESC LIMIT ?",
            )
            .bind(i64::from(limit))
            .fetch_all(&pool)
            .await?
        },
    };
    pool.close().await;

    if rows.is_empty() {
        eprintln!("no audit events");
    }
    for (timestamp_ms, tenant_id, operation, key_id, version, outcome, error_kind) in rows {
        println!(
            "{timestamp_ms} {tenant_id} {operation:<11} {outcome:<7} {} {} {}",
            key_id.as_deref().unwrap_or("-"),
            version.map_or_else(|| "-".to_string(), |v| format!("v{v}")),
            error_kind.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KeywardConfig::default();
        config.store.database_url =
            format!("sqlite:{}?mode=rwc", dir.path().join("keys.db").display());

        run_migrations(&config).await.unwrap();
        // Idempotent.
        run_migrations(&config).await.unwrap();
        print_audit(&config, Some("acme"), 10).await.unwrap();

        let pool = connect(&config).await.unwrap();
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        for expected in ["encryption_keys", "wrapped_key_material", "key_audit_log"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }
}
