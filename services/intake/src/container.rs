//! Composition root.
//!
//! Builds every adapter once at startup and hands the orchestrator to the
//! HTTP layer. Teardown goes through [`AppContainer::shutdown`].

use crate::api::{self, AppState};
use crate::classifier::{Classifier, HttpClassifier};
use crate::config::Config;
use crate::intake::TrashService;
use crate::object_storage::create_storage;
use crate::record_store::PgTrashStore;
use anyhow::{Context, Result};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

pub struct AppContainer {
    config: Config,
    store: Arc<PgTrashStore>,
    service: Arc<TrashService>,
}

impl AppContainer {
    /// Connect to the database, run migrations when enabled, and wire the
    /// storage adapter and optional classifier into the orchestrator
    pub async fn build(config: Config) -> Result<Self> {
        let store = Arc::new(
            PgTrashStore::new(&config.database)
                .await
                .context("Failed to initialize record store")?,
        );

        if config.database.run_migrations {
            store
                .run_migrations()
                .await
                .context("Failed to run database migrations")?;
        }

        let storage = create_storage(&config.storage)
            .await
            .context("Failed to initialize object storage")?;

        let classifier = HttpClassifier::from_config(&config.classifier)
            .context("Failed to initialize classifier client")?
            .map(|c| Arc::new(c) as Arc<dyn Classifier>);

        let service = TrashService::new(store.clone(), storage, classifier)
            .with_upload_url_ttl(config.storage.upload_url_ttl());

        info!(
            provider = %config.storage.provider,
            bucket = %config.storage.bucket,
            "Application container built"
        );

        Ok(Self {
            config,
            store,
            service: Arc::new(service),
        })
    }

    /// HTTP router over the orchestrator
    pub fn router(&self) -> Router {
        api::create_router(
            AppState {
                service: self.service.clone(),
            },
            &self.config.api,
        )
    }

    /// Serve HTTP until `shutdown` resolves
    pub async fn serve<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        api::serve(self.router(), &self.config.api, shutdown).await
    }

    /// Release pooled resources
    pub async fn shutdown(&self) {
        self.store.close().await;
        info!("Application container shut down");
    }
}
