//! PostgreSQL container for integration tests.

use gantry_db::Database;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

const IMAGE_TAG: &str = "16-alpine";

/// A throwaway PostgreSQL server. Stopped on drop.
pub struct PostgresContainer {
    _container: ContainerAsync<Postgres>,
    url: String,
}

impl PostgresContainer {
    pub async fn start() -> anyhow::Result<Self> {
        let container = Postgres::default().with_tag(IMAGE_TAG).start().await?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;

        Ok(Self {
            url: format!("postgres://postgres:postgres@{host}:{port}/postgres"),
            _container: container,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect to the server and apply the gantry migrations.
    pub async fn database(&self, max_connections: u32) -> anyhow::Result<Database> {
        let db = Database::connect(&self.url, max_connections).await?;
        db.migrate().await?;
        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_migrations_apply_on_fresh_server() {
        let pg = PostgresContainer::start().await.unwrap();
        assert!(pg.url().starts_with("postgres://"));
        pg.database(2).await.unwrap();
    }
}
