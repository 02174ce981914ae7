//! Engine assembly.
//!
//! [`SearchEngine`] wires the pool, schema, capability snapshot, analyzer,
//! writer, journal, coordinator and query services into one handle. It is
//! the embedding seam: construct it with a [`FileStore`] implementation,
//! replay the journal once at startup, optionally spawn the background
//! processor, and hand the services to the presentation layer.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analyzer::Analyzer;
use crate::capability::FtsCapability;
use crate::config::Config;
use crate::coordinator::IndexCoordinator;
use crate::db::ConnectionPool;
use crate::error::Result;
use crate::health::{HealthCheck, HealthReport};
use crate::history::{SearchFavoritesService, SearchHistoryService};
use crate::indexer::SearchIndexer;
use crate::journal::{ReplayReport, WriteAheadJournal};
use crate::processor::{ProcessorState, ReindexProcessor};
use crate::query::facets::FacetService;
use crate::query::lexical::SearchQueryService;
use crate::query::merge::MergeStrategy;
use crate::query::plan::QueryPlanner;
use crate::query::suggest::{SpellSuggestionService, SuggestionService};
use crate::query::trigram::TrigramSearch;
use crate::queue::ReindexQueue;
use crate::schema;
use crate::signature::SignatureCalculator;
use crate::store::{Clock, FileStore, SystemClock};
use crate::writer::ProjectionWriter;

pub struct SearchEngine {
    config: Config,
    pool: Arc<ConnectionPool>,
    store: Arc<dyn FileStore>,
    clock: Arc<dyn Clock>,
    analyzer: Arc<Analyzer>,
    signer: Arc<SignatureCalculator>,
    capability: Arc<FtsCapability>,
    writer: Arc<ProjectionWriter>,
    journal: Arc<WriteAheadJournal>,
    indexer: Arc<SearchIndexer>,
    queue: Arc<ReindexQueue>,
    coordinator: Arc<IndexCoordinator>,
    query: Arc<SearchQueryService>,
    facets: Arc<FacetService>,
    suggestions: Arc<SuggestionService>,
    spell: Arc<SpellSuggestionService>,
    history: Arc<SearchHistoryService>,
    favorites: Arc<SearchFavoritesService>,
}

impl SearchEngine {
    pub async fn open(config: Config, store: Arc<dyn FileStore>) -> Result<Self> {
        Self::open_with_clock(config, store, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        config: Config,
        store: Arc<dyn FileStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::open(&config).await?);
        let handle = pool.handle().await;
        schema::migrate(&handle).await?;
        let capability = Arc::new(FtsCapability::probe(&handle).await?);

        let analyzer = Arc::new(Analyzer::from_config(&config.analyzer)?);
        let signer = Arc::new(SignatureCalculator::new(Arc::clone(&analyzer)));
        let writer = Arc::new(ProjectionWriter::new(
            Arc::clone(&capability),
            Arc::clone(&analyzer),
            config.retry.clone(),
            config.trigram.clone(),
            Arc::clone(&clock),
        ));
        let journal = Arc::new(WriteAheadJournal::new(
            Arc::clone(&pool),
            Arc::clone(&writer),
            Arc::clone(&signer),
            Arc::clone(&clock),
        ));
        let suggestions = Arc::new(SuggestionService::new(
            Arc::clone(&pool),
            Arc::clone(&analyzer),
        ));
        let indexer = Arc::new(SearchIndexer::new(
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&writer),
            Arc::clone(&signer),
            Arc::clone(&suggestions),
            Arc::clone(&clock),
            config.indexing.max_content_bytes,
        ));
        let queue = Arc::new(ReindexQueue::new(Arc::clone(&pool)));
        let coordinator = Arc::new(IndexCoordinator::new(
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&writer),
            Arc::clone(&signer),
            Arc::clone(&queue),
            Arc::clone(&clock),
            config.indexing.mode,
        ));

        let planner = QueryPlanner::new(Arc::clone(&analyzer), config.trigram.clone());
        let trigram = TrigramSearch::new(
            Arc::clone(&analyzer),
            config.trigram.clone(),
            config.query.candidate_cap,
        );
        let merger = MergeStrategy::from_config(&config.merge);
        let query = Arc::new(SearchQueryService::new(
            Arc::clone(&pool),
            Arc::clone(&capability),
            planner,
            trigram,
            merger,
            config.query.candidate_cap,
            config.query.snippet_tokens,
        ));
        let facets = Arc::new(FacetService::new(Arc::clone(&pool)));
        let spell = Arc::new(SpellSuggestionService::new(
            Arc::clone(&pool),
            Arc::clone(&analyzer),
            config.query.spell_threshold,
        ));
        let history = Arc::new(SearchHistoryService::new(
            Arc::clone(&pool),
            Arc::clone(&clock),
        ));
        let favorites = Arc::new(SearchFavoritesService::new(
            Arc::clone(&pool),
            Arc::clone(&clock),
        ));

        Ok(Self {
            config,
            pool,
            store,
            clock,
            analyzer,
            signer,
            capability,
            writer,
            journal,
            indexer,
            queue,
            coordinator,
            query,
            facets,
            suggestions,
            spell,
            history,
            favorites,
        })
    }

    /// Replays pending write-ahead entries. Call once at startup before
    /// accepting writes.
    pub async fn replay_journal(&self, cancel: &CancellationToken) -> Result<ReplayReport> {
        self.journal.replay_pending(self.store.as_ref(), cancel).await
    }

    /// Builds the background processor and spawns its run loop.
    pub fn start_processor(&self) -> (Arc<ReindexProcessor>, JoinHandle<()>) {
        let processor = Arc::new(ReindexProcessor::new(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.queue),
            self.config.reindex.clone(),
            Arc::clone(&self.clock),
        ));
        let runner = Arc::clone(&processor);
        let handle = tokio::spawn(async move { runner.run().await });
        (processor, handle)
    }

    pub fn health(&self, processor_state: Option<watch::Receiver<ProcessorState>>) -> HealthCheck {
        HealthCheck::new(Arc::clone(&self.pool), processor_state)
    }

    pub async fn health_report(&self) -> Result<HealthReport> {
        self.health(None).check().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn analyzer(&self) -> &Arc<Analyzer> {
        &self.analyzer
    }

    pub fn signer(&self) -> &Arc<SignatureCalculator> {
        &self.signer
    }

    pub fn capability(&self) -> &Arc<FtsCapability> {
        &self.capability
    }

    pub fn writer(&self) -> &Arc<ProjectionWriter> {
        &self.writer
    }

    pub fn indexer(&self) -> &Arc<SearchIndexer> {
        &self.indexer
    }

    pub fn coordinator(&self) -> &Arc<IndexCoordinator> {
        &self.coordinator
    }

    pub fn reindex_queue(&self) -> &Arc<ReindexQueue> {
        &self.queue
    }

    pub fn query(&self) -> &Arc<SearchQueryService> {
        &self.query
    }

    pub fn facets(&self) -> &Arc<FacetService> {
        &self.facets
    }

    pub fn suggestions(&self) -> &Arc<SuggestionService> {
        &self.suggestions
    }

    pub fn spell(&self) -> &Arc<SpellSuggestionService> {
        &self.spell
    }

    pub fn history(&self) -> &Arc<SearchHistoryService> {
        &self.history
    }

    pub fn favorites(&self) -> &Arc<SearchFavoritesService> {
        &self.favorites
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
