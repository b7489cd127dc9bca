//! Articles demo - runnable binary.
//!
//! Publishes a few articles, appending an `ArticlePublished` outbox message in the
//! same transaction as each article, then runs a Dispatcher until the outbox is
//! drained (or Ctrl-C).
//!
//! Storage is in-memory by default. Built with `--features postgres` and run with
//! `DATABASE_URL` set, articles and messages go to `PostgreSQL` instead.
//!
//! `METRICS_ADDR` (e.g. `0.0.0.0:9090`) exposes Prometheus metrics; `OUTBOX_*`
//! variables configure the dispatcher.

use anyhow::{Context, Result};
use articles::{SearchIndex, registry, sample_articles};
use composable_outbox_core::{ConsumerLedger, ConsumerRegistry, MessageStore};
use composable_outbox_runtime::metrics::MetricsServer;
use composable_outbox_runtime::{Dispatcher, DispatcherConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = DispatcherConfig::from_env().context("invalid dispatcher configuration")?;

    let mut metrics = None;
    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let mut server = MetricsServer::new(addr.parse().context("invalid METRICS_ADDR")?);
        server.start()?;
        metrics = Some(server);
    }

    let index = SearchIndex::new();
    let consumers = Arc::new(registry(index.clone())?);

    match std::env::var("DATABASE_URL") {
        #[cfg(feature = "postgres")]
        Ok(database_url) => postgres::run(&database_url, consumers, config).await?,
        #[cfg(not(feature = "postgres"))]
        Ok(_) => {
            tracing::warn!("DATABASE_URL is set but the demo was built without the `postgres` feature");
            in_memory::run(consumers, config).await?;
        }
        Err(_) => in_memory::run(consumers, config).await?,
    }

    for (id, title) in index.documents() {
        info!(article_id = id, title = %title, "Indexed");
    }
    if let Some(rendered) = metrics.as_ref().and_then(MetricsServer::render) {
        info!(bytes = rendered.len(), "Metrics available for scraping");
    }

    Ok(())
}

/// Run the dispatcher until the outbox has no pending messages or Ctrl-C.
async fn drain<S>(store: Arc<S>, consumers: Arc<ConsumerRegistry>, config: DispatcherConfig) -> Result<()>
where
    S: MessageStore + ConsumerLedger + 'static,
{
    let (mut dispatcher, shutdown) = Dispatcher::new(Arc::clone(&store), consumers, config);
    let running = tokio::spawn(async move { dispatcher.run().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("Ctrl-C received");
        }
        result = wait_until_drained(store.as_ref()) => {
            result?;
            info!("Outbox drained");
        }
    }

    shutdown.send(true).ok();
    running.await.context("dispatcher task failed")?;
    Ok(())
}

async fn wait_until_drained<S: MessageStore>(store: &S) -> Result<()> {
    loop {
        let pending = store.count_pending().await?;
        if pending == 0 {
            return Ok(());
        }
        tracing::debug!(pending, "Waiting for dispatcher");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

mod in_memory {
    use super::{ConsumerRegistry, DispatcherConfig, Result, drain, info, sample_articles};
    use articles::publish_article;
    use composable_outbox_testing::InMemoryOutbox;
    use std::sync::Arc;

    pub async fn run(consumers: Arc<ConsumerRegistry>, config: DispatcherConfig) -> Result<()> {
        info!("Using in-memory storage");
        let outbox = InMemoryOutbox::new();

        for article in sample_articles() {
            let mut tx = outbox.begin();
            let id = publish_article(&outbox, &mut tx, &article).await?;
            outbox.commit(tx);
            info!(article_id = article.id, message_id = %id, "Article published");
        }

        drain(Arc::new(outbox), consumers, config).await
    }
}

#[cfg(feature = "postgres")]
mod postgres {
    use super::{ConsumerRegistry, Context, DispatcherConfig, Result, drain, info, sample_articles};
    use articles::publish_article;
    use composable_outbox_postgres::PostgresOutbox;
    use std::sync::Arc;

    pub async fn run(database_url: &str, consumers: Arc<ConsumerRegistry>, config: DispatcherConfig) -> Result<()> {
        info!("Using PostgreSQL storage");
        let outbox = PostgresOutbox::connect(database_url).await?;
        outbox.migrate().await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS articles (
                id BIGINT PRIMARY KEY,
                title TEXT NOT NULL,
                author TEXT NOT NULL
            )
            ",
        )
        .execute(outbox.pool())
        .await
        .context("failed to create articles table")?;

        for article in sample_articles() {
            let mut tx = outbox.begin().await?;
            let inserted = sqlx::query(
                "INSERT INTO articles (id, title, author) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
            )
            .bind(article.id)
            .bind(&article.title)
            .bind(&article.author)
            .execute(&mut *tx)
            .await
            .context("failed to insert article")?;

            if inserted.rows_affected() == 0 {
                tx.rollback().await?;
                info!(article_id = article.id, "Article already published");
                continue;
            }

            let id = publish_article(&outbox, &mut tx, &article).await?;
            tx.commit().await.context("failed to commit article")?;
            info!(article_id = article.id, message_id = %id, "Article published");
        }

        drain(Arc::new(outbox), consumers, config).await
    }
}
