//! Local cache of book texts
//!
//! Texts are downloaded from Project Gutenberg on first access, then kept on
//! disk forever using the same directory layout as the Gutenberg mirror.

use crate::{config::Config, locks::KeyedLocks, BookId};
use reqwest::StatusCode;
use std::{
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};
use tokio::fs;

/// Full text of a book
pub type RawText = Box<str>;

/// Reasons why a book text could not be provided
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The book does not exist upstream, at least not as plain text
    #[error("book {id} has no plain text edition at {url}")]
    NotFound { id: BookId, url: Box<str> },

    /// A network problem occured, trying again later may work
    #[error("failed to download {url}")]
    Transient {
        url: Box<str>,
        #[source]
        source: reqwest::Error,
    },

    /// The book is not cached and network access is disabled
    #[error("book {0} is not cached locally and network access is disabled")]
    Offline(BookId),

    /// The local copy of the book could not be read or written
    #[error("failed to access the local copy of book {id}")]
    Storage {
        id: BookId,
        #[source]
        source: io::Error,
    },
}

/// Local cache of book texts
#[derive(Debug)]
pub struct TextCache {
    /// Process configuration
    config: Arc<Config>,

    /// HTTP client used for downloads
    client: reqwest::Client,

    /// Books that are being looked up, used to avoid duplicate downloads
    in_flight: KeyedLocks<BookId>,
}
//
impl TextCache {
    /// Set up the cache
    pub fn new(config: Arc<Config>, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            in_flight: KeyedLocks::new(),
        }
    }

    /// Get the text of a book, downloading it if needed
    ///
    /// If multiple tasks ask for the same book at the same time, only one of
    /// them downloads it, the others wait and read the downloaded copy.
    pub async fn get(&self, id: BookId) -> Result<RawText, FetchError> {
        let _in_flight = self.in_flight.lock(id).await;

        // Look for a local copy first
        let path = self.config.text_path(id);
        match fs::read(&path).await {
            Ok(bytes) => {
                log::debug!("Found book {id} at {}", path.display());
                return Ok(decode(&bytes));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => return Err(FetchError::Storage { id, source }),
        }

        // Download it if allowed to
        if self.config.offline {
            return Err(FetchError::Offline(id));
        }
        log::info!("Book {id} is not cached, downloading it");
        let bytes = self.download(id).await?;
        save(&path, &bytes)
            .await
            .map_err(|source| FetchError::Storage { id, source })?;
        log::debug!("Saved book {id} to {}", path.display());
        Ok(decode(&bytes))
    }

    /// Download a book text
    async fn download(&self, id: BookId) -> Result<Vec<u8>, FetchError> {
        let url = self.config.text_url(id);
        log::debug!("Fetching {url}");
        let transient = |source: reqwest::Error| FetchError::Transient {
            url: url.as_str().into(),
            source,
        };
        let response = self.client.get(&url).send().await.map_err(transient)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                id,
                url: url.as_str().into(),
            });
        }
        let response = response.error_for_status().map_err(transient)?;
        let bytes = response.bytes().await.map_err(transient)?;
        Ok(bytes.to_vec())
    }
}

/// Decode a book text
///
/// Gutenberg plain texts are UTF-8, but a few stray bytes should not make the
/// whole book unusable.
fn decode(bytes: &[u8]) -> RawText {
    String::from_utf8_lossy(bytes).into()
}

/// Save a downloaded book text
///
/// The text is first written to a temporary file which is then renamed, so
/// that readers never see a partially written text.
async fn save(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("txt.part");
    fs::write(&temp_path, bytes).await?;
    fs::rename(&temp_path, path).await
}
