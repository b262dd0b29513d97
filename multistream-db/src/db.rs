use turso::{Builder, Connection, Database};

pub struct DatabaseConfig<'a> {
    url: &'a str,
}

impl<'a> DatabaseConfig<'a> {
    pub fn new(url: &'a str) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &str {
        self.url
    }
}

/// Handle to the stream database shared by the engine and its tools.
pub struct StreamDatabase {
    db: Database,
}

impl StreamDatabase {
    pub async fn new(config: &DatabaseConfig<'_>) -> anyhow::Result<Self> {
        let db = Builder::new_local(config.url).build().await?;

        // WAL so the dashboard can read while the engine writes status
        let conn = db.connect().map_err(anyhow::Error::from)?;
        conn.pragma_update("journal_mode", "wal").await?;

        Ok(Self { db })
    }

    /// Open the database and bring its schema up to date.
    pub async fn open(url: &str) -> anyhow::Result<Self> {
        let config = DatabaseConfig::new(url);
        let db = Self::new(&config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open database {}: {:?}", url, e))?;
        crate::migrations::migrate(&db).await?;
        Ok(db)
    }

    pub fn connect(&self) -> anyhow::Result<Connection> {
        self.db.connect().map_err(anyhow::Error::from)
    }
}
