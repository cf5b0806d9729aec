use actix_web::{dev::Service, web, App, HttpServer};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use job_recommender::config::Config;
use job_recommender::db::{
    self, IndexStore, PgEmbeddingStore, PgIndexStore, PgRecommendationStore,
};
use job_recommender::embedding;
use job_recommender::events::{ConsumerOptions, EventConsumer, KafkaTransport};
use job_recommender::index::{bootstrap_index, BootstrapOptions};
use job_recommender::services::{EventProcessor, JobIndexer, RecommendationEngine};

const REBUILD_PAGE_SIZE: i64 = 5000;

fn fatal(context: &str, err: impl std::fmt::Display) -> ! {
    error!("{}: {:#}", context, err);
    eprintln!("ERROR: {}: {}", context, err);
    std::process::exit(1);
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .with_target(true),
        )
        .init();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => fatal("Failed to load configuration", e),
    };

    info!("Starting job-recommender v{}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.env);

    // Database (standardized pool)
    let mut db_cfg = db_pool::DbConfig::for_service("job-recommender");
    db_cfg.database_url = config.database.url.clone();
    db_cfg.max_connections = std::cmp::max(db_cfg.max_connections, config.database.max_connections);
    let pool = match db_pool::create_pool(db_cfg).await {
        Ok(pool) => pool,
        Err(e) => fatal("Failed to create database pool", e),
    };
    if let Err(e) = db::run_migrations(&pool).await {
        fatal("Database migrations failed", e);
    }

    // A dimension mismatch between the embedding source and the index is
    // a configuration error; refuse to start
    let embedder = match embedding::from_config(&config.embedding) {
        Ok(source) => source,
        Err(e) => fatal("Failed to build embedding source", e),
    };
    if let Err(e) = embedding::verify_dimension(embedder.as_ref(), config.embedding.dimension).await {
        fatal("Embedding source check failed", e);
    }

    let embedding_store = Arc::new(PgEmbeddingStore::new(pool.clone()));
    let index_store: Arc<dyn IndexStore> = Arc::new(PgIndexStore::new(pool.clone()));
    let recommendation_store = Arc::new(PgRecommendationStore::new(pool.clone()));

    let options = BootstrapOptions {
        name: config.index.name.clone(),
        dimension: config.embedding.dimension,
        persist_interval: config.index.persist_interval(),
        rebuild_on_fallback: config.index.rebuild_on_fallback,
        page_size: REBUILD_PAGE_SIZE,
    };
    let (index, persistence) =
        match bootstrap_index(index_store, embedding_store.as_ref(), &options).await {
            Ok(loaded) => loaded,
            Err(e) => fatal("Failed to load job index", e),
        };

    let engine = Arc::new(RecommendationEngine::new(
        index.clone(),
        embedder.clone(),
        recommendation_store,
        &config.recommendation,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_handle = if config.app.consumer_enabled {
        let indexer = JobIndexer::new(embedder.clone(), embedding_store.clone(), index.clone());
        let processor = Arc::new(EventProcessor::new(
            indexer,
            engine.clone(),
            persistence,
            index.clone(),
        ));
        let consumer = EventConsumer::new(
            KafkaTransport::new(config.kafka.clone()),
            processor,
            ConsumerOptions {
                job_topic_prefix: config.kafka.job_topic_prefix.clone(),
                profile_topic_prefix: config.kafka.profile_topic_prefix.clone(),
                max_redeliveries: config.kafka.max_redeliveries,
                reconnect: resilience::broker_reconnect(),
            },
            shutdown_rx,
        );
        info!(
            brokers = %config.kafka.bootstrap_servers,
            "Starting event consumer"
        );
        Some(tokio::spawn(consumer.run()))
    } else {
        warn!("Event consumer disabled (CONSUMER_ENABLED=false); serving queries only");
        None
    };

    let engine_data = web::Data::from(engine);
    let bind_addr = format!("{}:{}", config.app.host, config.app.port);
    info!("HTTP server listening on {}", bind_addr);

    let server_result = HttpServer::new(move || {
        App::new()
            .app_data(engine_data.clone())
            .wrap_fn(|req, srv| {
                let method = req.method().to_string();
                let path = req
                    .match_pattern()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| req.path().to_string());
                let start = Instant::now();

                let fut = srv.call(req);
                async move {
                    match fut.await {
                        Ok(res) => {
                            job_recommender::metrics::observe_http_request(
                                &method,
                                &path,
                                res.status().as_u16(),
                                start.elapsed(),
                            );
                            Ok(res)
                        }
                        Err(err) => {
                            job_recommender::metrics::observe_http_request(
                                &method,
                                &path,
                                500,
                                start.elapsed(),
                            );
                            Err(err)
                        }
                    }
                }
            })
            .configure(job_recommender::handlers::configure)
    })
    .bind(&bind_addr)?
    .run()
    .await;

    // HTTP server stopped on SIGINT/SIGTERM; let the consumer finish its
    // in-flight message and flush the index
    let _ = shutdown_tx.send(true);
    if let Some(handle) = consumer_handle {
        match handle.await {
            Ok(stats) => info!(stats = ?stats, "Event consumer finished"),
            Err(e) => error!(error = %e, "Event consumer task failed"),
        }
    }

    pool.close().await;
    info!("job-recommender stopped");
    server_result
}
