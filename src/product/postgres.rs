//! PostgreSQL product repository.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

use super::{ProcessingStatus, ProductRepository};
use crate::config::model::DatabaseConfig;
use crate::error::RepositoryError;

const UPDATE_STATUS: &str =
    "UPDATE app_products SET processing_status = $1, updated_at = NOW() WHERE id = $2";

const UPDATE_COMPRESSED_IMAGES: &str =
    "UPDATE app_products SET compressed_product_images = $1, updated_at = NOW() WHERE id = $2";

/// Product repository backed by the `app_products` table.
#[derive(Clone)]
pub struct PgProductRepository {
    pool: PgPool,
}

impl PgProductRepository {
    /// Opens a connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url())
            .await
            .map_err(|e| RepositoryError::ConnectionFailed(e.to_string()))?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.name,
            "Connected to PostgreSQL"
        );
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn to_db_id(product_id: u64) -> Result<i64, RepositoryError> {
        i64::try_from(product_id).map_err(|_| RepositoryError::UpdateFailed {
            product_id,
            message: "product id exceeds the BIGINT range".to_string(),
        })
    }
}

#[async_trait]
impl ProductRepository for PgProductRepository {
    async fn update_processing_status(
        &self,
        product_id: u64,
        status: ProcessingStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(UPDATE_STATUS)
            .bind(status.as_str())
            .bind(Self::to_db_id(product_id)?)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::UpdateFailed {
                product_id,
                message: e.to_string(),
            })?;

        if result.rows_affected() == 0 {
            warn!(product_id, status = %status, "Status update matched no product");
        }
        Ok(())
    }

    async fn update_compressed_images(
        &self,
        product_id: u64,
        images: &[String],
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(UPDATE_COMPRESSED_IMAGES)
            .bind(images.to_vec())
            .bind(Self::to_db_id(product_id)?)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::UpdateFailed {
                product_id,
                message: e.to_string(),
            })?;

        if result.rows_affected() == 0 {
            warn!(product_id, "Compressed image update matched no product");
        }
        Ok(())
    }
}
