//! Service wiring shared by the CLI and the HTTP server.

use std::sync::Arc;

use anyhow::{Context, Result};
use docchat_core::embedding::Embedder;
use docchat_core::store::Store;

use crate::chat::ChatOrchestrator;
use crate::config::Config;
use crate::documents::DocumentStore;
use crate::embedding::create_embedder;
use crate::generation::{create_generator, Generator};
use crate::ledger::QuotaLedger;
use crate::retriever::Retriever;
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub documents: Arc<DocumentStore>,
    pub retriever: Arc<Retriever>,
    pub ledger: Arc<QuotaLedger>,
    pub chat: Arc<ChatOrchestrator>,
}

impl App {
    /// Assemble the services over explicit backends. Indexes are not
    /// loaded; call [`DocumentStore::load_indexes`] for a persistent store.
    pub fn build(
        config: Config,
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        let documents = Arc::new(
            DocumentStore::new(
                store.clone(),
                embedder.clone(),
                config.chunking.params(),
                config.ingest.clone(),
            )
            .context("Invalid chunking configuration")?,
        );
        let retriever = Arc::new(Retriever::new(store.clone(), embedder, documents.clone()));
        let ledger = Arc::new(QuotaLedger::new(
            store.clone(),
            config.quota.default_allocation,
            config.quota.max_cas_attempts,
        ));
        let chat = Arc::new(ChatOrchestrator::new(
            store,
            retriever.clone(),
            ledger.clone(),
            generator,
            config.prompt_policy(),
            config.prompt.system_prompt.clone(),
            config.retrieval.k,
        ));
        Ok(Self {
            config: Arc::new(config),
            documents,
            retriever,
            ledger,
            chat,
        })
    }

    /// Open the configured database, run migrations, create the providers,
    /// and load every ready document's index. Documents still in the
    /// pipeline are left as they are; the server recovers them on startup.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        let app = Self::build(config, store, embedder, generator)?;
        app.documents
            .load_indexes()
            .await
            .context("Failed to load vector indexes")?;
        Ok(app)
    }
}
