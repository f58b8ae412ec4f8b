use anyhow::Result;
use sqlx::SqlitePool;

/// Create the incident store schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS incidents (
            event_id TEXT PRIMARY KEY,
            raw_text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Derived vectors, one row per incident. The store is the source of
    // truth; this table is rebuildable by replaying incidents through the
    // encoder.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS incident_vectors (
            event_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (event_id) REFERENCES incidents(event_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_incidents_created_at ON incidents(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
