//! Articles demo domain.
//!
//! Publishing an article appends an `ArticlePublished` outbox message in the same
//! transaction as the article itself. Two consumers react to it: a search
//! indexer and a subscriber notifier.

use composable_outbox_core::{
    ConsumerHandler, ConsumerRegistry, HandlerError, HandlerFuture, MessageId, NewOutboxMessage,
    OutboxError, OutboxWriter, RegistryError, handler_fn,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Outbox message type for [`ArticlePublished`].
pub const ARTICLE_PUBLISHED: &str = "ArticlePublished";

/// An article being published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    /// Article id
    pub id: i64,
    /// Headline
    pub title: String,
    /// Author's display name
    pub author: String,
}

/// Domain event recorded when an article goes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticlePublished {
    /// Article id
    pub article_id: i64,
    /// Headline
    pub title: String,
    /// Author's display name
    pub author: String,
}

impl From<&Article> for ArticlePublished {
    fn from(article: &Article) -> Self {
        Self {
            article_id: article.id,
            title: article.title.clone(),
            author: article.author.clone(),
        }
    }
}

/// Append the `ArticlePublished` event for `article` inside `tx`.
///
/// The caller writes the article itself through the same transaction and
/// commits both together.
///
/// # Errors
///
/// Returns [`OutboxError`] if the event cannot be serialized or appended; the
/// caller must then roll back.
pub async fn publish_article<W: OutboxWriter>(
    outbox: &W,
    tx: &mut W::Transaction,
    article: &Article,
) -> Result<MessageId, OutboxError> {
    let event = ArticlePublished::from(article);
    let message = NewOutboxMessage::json(ARTICLE_PUBLISHED, &event)?;
    outbox.append(tx, message).await
}

/// In-process search index fed by `ArticlePublished`.
#[derive(Debug, Clone, Default)]
pub struct SearchIndex {
    documents: Arc<Mutex<BTreeMap<i64, String>>>,
}

impl SearchIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexed titles by article id.
    #[must_use]
    pub fn documents(&self) -> BTreeMap<i64, String> {
        self.documents
            .lock()
            .map(|documents| documents.clone())
            .unwrap_or_default()
    }
}

impl ConsumerHandler for SearchIndex {
    fn handle<'a>(&'a self, _message_type: &'a str, content: &'a str) -> HandlerFuture<'a> {
        Box::pin(async move {
            let event: ArticlePublished = serde_json::from_str(content).map_err(HandlerError::failed)?;
            if event.title.trim().is_empty() {
                return Err(HandlerError::failed(format!(
                    "article {} has no title to index",
                    event.article_id
                )));
            }

            let mut documents = self
                .documents
                .lock()
                .map_err(|_| HandlerError::failed("search index lock poisoned"))?;
            documents.insert(event.article_id, event.title);
            Ok(())
        })
    }
}

/// Build the registry: `search-indexer` and `notify-subscribers` consume
/// `ArticlePublished`.
///
/// # Errors
///
/// Returns [`RegistryError`] if a consumer is registered twice.
pub fn registry(index: SearchIndex) -> Result<ConsumerRegistry, RegistryError> {
    let notifier = handler_fn(|_message_type, content| async move {
        let event: ArticlePublished = serde_json::from_str(&content).map_err(HandlerError::failed)?;
        tracing::info!(
            article_id = event.article_id,
            author = %event.author,
            "Notifying subscribers about \"{}\"",
            event.title
        );
        Ok(())
    });

    Ok(ConsumerRegistry::builder()
        .register(ARTICLE_PUBLISHED, "search-indexer", index)?
        .register(ARTICLE_PUBLISHED, "notify-subscribers", notifier)?
        .build())
}

/// Articles published by the demo.
#[must_use]
pub fn sample_articles() -> Vec<Article> {
    vec![
        Article {
            id: 1,
            title: "Transactional outboxes in practice".to_string(),
            author: "Ada".to_string(),
        },
        Article {
            id: 2,
            title: "Idempotent consumers".to_string(),
            author: "Grace".to_string(),
        },
        Article {
            id: 3,
            title: "Leases versus row locks".to_string(),
            author: "Barbara".to_string(),
        },
    ]
}
