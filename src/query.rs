//! Word frequency queries
//!
//! Book queries compute word counts on first use: the book text is fetched
//! (from the local cache or from Project Gutenberg), normalized, and the
//! resulting counts are committed to the frequency store before ranking.
//! Word queries only look at books that were processed before.

use crate::{
    cache::{FetchError, TextCache},
    catalog::Catalog,
    config::Config,
    locks::KeyedLocks,
    normalize::{self, Normalized},
    store::FrequencyStore,
    top::{Ranked, RankedResult},
    BookId, Count, Word,
};
use std::{num::NonZeroUsize, sync::Arc};
use tokio::task::JoinError;

/// Reasons why a book could not be processed
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The book does not exist, or has no plain text edition
    #[error("book {0} not found")]
    BookNotFound(BookId),

    /// The book is not cached locally and network access is disabled
    #[error("book {0} is not cached locally and network access is disabled")]
    Unavailable(BookId),

    /// The book could not be downloaded, but trying again later may work
    #[error("failed to download book {id}, please try again later")]
    Transient {
        id: BookId,
        #[source]
        source: FetchError,
    },

    /// The local copy of the book could not be accessed
    #[error("failed to access the local copy of book {id}")]
    Storage {
        id: BookId,
        #[source]
        source: FetchError,
    },

    /// Word counting crashed
    #[error("failed to count the words of book {id}")]
    Normalization {
        id: BookId,
        #[source]
        source: JoinError,
    },

    /// The task that was processing the book crashed
    #[error("processing of book {id} crashed")]
    Crashed {
        id: BookId,
        #[source]
        source: JoinError,
    },
}
//
impl QueryError {
    /// Translate a text lookup failure
    fn from_fetch(id: BookId, error: FetchError) -> Self {
        match error {
            FetchError::NotFound { .. } => Self::BookNotFound(id),
            FetchError::Offline(_) => Self::Unavailable(id),
            source @ FetchError::Transient { .. } => Self::Transient { id, source },
            source @ FetchError::Storage { .. } => Self::Storage { id, source },
        }
    }

    /// Book that could not be processed
    pub fn book_id(&self) -> BookId {
        match self {
            Self::BookNotFound(id) | Self::Unavailable(id) => *id,
            Self::Transient { id, .. }
            | Self::Storage { id, .. }
            | Self::Normalization { id, .. }
            | Self::Crashed { id, .. } => *id,
        }
    }

    /// Truth that the same query may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// What happened when a book was processed
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Ingestion {
    /// Word counts were already known
    Cached,

    /// Word counts were computed and committed
    Computed {
        /// Truth that the Gutenberg header and footer were stripped
        stripped: bool,
    },
}

/// Book where a word appears, as returned by word queries
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BookHit {
    /// Book identifier
    pub id: BookId,

    /// Book title, empty if the book is not in the catalog
    pub title: Box<str>,

    /// Number of occurences of the word in the book
    pub count: Count,
}

/// Query processor
#[derive(Debug)]
pub struct QueryEngine {
    /// Process configuration
    config: Arc<Config>,

    /// Source of book texts
    texts: TextCache,

    /// Word counts of processed books
    store: Arc<FrequencyStore>,

    /// Books that are being processed
    ///
    /// Checking for existing counts and committing new ones must be atomic,
    /// otherwise concurrent queries for the same book would commit its counts
    /// twice.
    books: KeyedLocks<BookId>,
}
//
impl QueryEngine {
    /// Set up a query processor
    pub fn new(config: Arc<Config>, client: reqwest::Client, store: Arc<FrequencyStore>) -> Self {
        Self {
            texts: TextCache::new(config.clone(), client),
            config,
            store,
            books: KeyedLocks::new(),
        }
    }

    /// Most frequent words of a book, computing them if needed
    pub async fn top_words(
        &self,
        id: BookId,
        limit: Option<NonZeroUsize>,
    ) -> Result<RankedResult<Word>, QueryError> {
        log::info!("Querying for book {id}");
        self.ingest(id).await?;
        Ok(self.store.top_column_entries(id, limit).unwrap_or_default())
    }

    /// Books where a word is most frequent, among processed books
    ///
    /// Books that are missing from the catalog are kept, with an empty title.
    pub fn top_books(&self, word: &str, limit: Option<NonZeroUsize>, catalog: &Catalog) -> Vec<BookHit> {
        let word = word.trim().to_lowercase();
        log::info!("Querying for word {word:?}");
        (self.store.get_row(&word, limit).into_iter())
            .map(|Ranked { key: id, score }| {
                let title = catalog.title(id).unwrap_or_else(|| {
                    log::debug!("Book {id} is not in the catalog");
                    ""
                });
                BookHit {
                    id,
                    title: title.into(),
                    count: score,
                }
            })
            .collect()
    }

    /// Make sure that the word counts of a book are known
    pub async fn ingest(&self, id: BookId) -> Result<Ingestion, QueryError> {
        let _book = self.books.lock(id).await;
        if self.store.has_column(id) {
            log::debug!("Word counts of book {id} are cached");
            return Ok(Ingestion::Cached);
        }
        log::debug!("Word counts of book {id} are not cached, computing them");
        let Normalized { counts, stripped } = self.normalize(id).await?;
        self.store.commit_column(id, counts);
        Ok(Ingestion::Computed { stripped })
    }

    /// Recompute the word counts of a book, replacing any previous counts
    pub async fn reprocess(&self, id: BookId) -> Result<Ingestion, QueryError> {
        let _book = self.books.lock(id).await;
        log::debug!("Recomputing the word counts of book {id}");
        let Normalized { counts, stripped } = self.normalize(id).await?;
        match self.store.get_column(id) {
            Some(previous) if previous == counts => {
                log::debug!("Word counts of book {id} did not change");
                return Ok(Ingestion::Computed { stripped });
            }
            Some(previous) => log::info!(
                "Word counts of book {id} changed from {} to {} distinct words",
                previous.len(),
                counts.len()
            ),
            None => {}
        }
        self.store.replace_column(id, counts);
        Ok(Ingestion::Computed { stripped })
    }

    /// Forget the word counts of a book, returns truth that they were known
    ///
    /// The book text stays cached, so counts can be computed again later.
    pub async fn forget(&self, id: BookId) -> bool {
        let _book = self.books.lock(id).await;
        self.store.remove_column(id)
    }

    /// Fetch and normalize a book text
    async fn normalize(&self, id: BookId) -> Result<Normalized, QueryError> {
        let text = (self.texts.get(id).await).map_err(|e| QueryError::from_fetch(id, e))?;
        let config = self.config.normalizer;
        let normalized = tokio::task::spawn_blocking(move || normalize::normalize(&text, &config))
            .await
            .map_err(|source| QueryError::Normalization { id, source })?;
        if !normalized.stripped {
            log::warn!(
                "Could not find the Project Gutenberg header and footer of book {id}, counting words in the whole text"
            );
        }
        Ok(normalized)
    }
}
