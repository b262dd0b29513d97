use std::path::Path;

use crate::db::StreamDatabase;

const MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER NOT NULL PRIMARY KEY,
    description TEXT NOT NULL,
    createtime TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

#[derive(Debug, rust_embed::Embed)]
#[folder = "migrations/"]
struct Migrations;

/// Apply every embedded migration that has not been recorded yet.
pub async fn migrate(db: &StreamDatabase) -> anyhow::Result<()> {
    let mut conn = db.connect()?;
    conn.execute_batch(MIGRATIONS_TABLE_SQL).await?;

    let mut migrations = load_migrations()?;
    migrations.sort_by_key(|m| m.version);

    for migration in migrations {
        if is_applied(&conn, migration.version).await? {
            continue;
        }
        let tx = conn.transaction().await?;
        tx.execute_batch(&migration.sql).await?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            (migration.version, migration.description.as_str()),
        )
        .await?;
        tx.commit().await?;
    }

    Ok(())
}

async fn is_applied(conn: &turso::Connection, version: i64) -> anyhow::Result<bool> {
    let mut rows = conn
        .query("SELECT 1 FROM _migrations WHERE version = ?1", (version,))
        .await?;
    Ok(rows.next().await?.is_some())
}

struct Migration {
    version: i64,
    description: String,
    sql: String,
}

/// Splits `<VERSION>_<DESCRIPTION>.sql` into its parts.
fn parse_file_name(name: &str) -> Option<(i64, String)> {
    let (version, rest) = name.split_once('_')?;
    let description = rest.strip_suffix(".sql")?;
    let version = version.parse().ok()?;
    Some((version, description.replace('_', " ")))
}

fn load_migrations() -> anyhow::Result<Vec<Migration>> {
    let mut migrations = Vec::new();
    for path in Migrations::iter() {
        let Some(file) = Migrations::get(&path) else {
            continue;
        };
        let name = Path::new(path.as_ref())
            .file_name()
            .and_then(|x| x.to_str())
            .unwrap_or("");
        let Some((version, description)) = parse_file_name(name) else {
            continue;
        };
        let sql = std::str::from_utf8(file.data.as_ref())
            .map_err(|e| anyhow::anyhow!("migration {} is not utf-8: {}", name, e))?;
        migrations.push(Migration {
            version,
            description,
            sql: sql.to_owned(),
        });
    }
    Ok(migrations)
}
