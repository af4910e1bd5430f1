//! Program configuration

use crate::{normalize::NormalizerConfig, Args, BookId, Result};
use anyhow::Context;
use directories::ProjectDirs;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Default location of the Project Gutenberg plain text mirror
pub const DEFAULT_TEXT_BASE_URL: &str = "https://gutenberg.org/cache/epub";

/// Default location of the Project Gutenberg catalog
pub const DEFAULT_CATALOG_URL: &str = "https://gutenberg.org/cache/epub/feeds/pg_catalog.csv.gz";

/// Final process configuration
///
/// This is the result of digesting the global [`Args`]. Please refer to
/// [`Args`] to know more about individual fields.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Config {
    /// Directory where texts, the catalog and word frequencies are kept
    pub cache_dir: Box<Path>,

    /// Base URL of book texts, without trailing slash
    pub text_base_url: Box<str>,

    /// URL of the gzipped CSV catalog
    pub catalog_url: Box<str>,

    /// Maximal duration of a network request
    pub fetch_timeout: Duration,

    /// Truth that the network should never be used
    pub offline: bool,

    /// Truth that the catalog should be downloaded again
    pub refresh_catalog: bool,

    /// Word counting configuration
    pub normalizer: NormalizerConfig,
}
//
impl Config {
    /// Determine process configuration from CLI arguments
    pub(crate) fn new(args: &Args) -> Result<Arc<Self>> {
        let cache_dir = match &args.cache_dir {
            Some(dir) => dir.clone().into_boxed_path(),
            None => default_cache_dir()?,
        };
        Ok(Arc::new(Self {
            cache_dir,
            text_base_url: args.text_base_url.trim_end_matches('/').into(),
            catalog_url: args.catalog_url.clone(),
            fetch_timeout: Duration::from_secs(args.timeout.get()),
            offline: args.offline,
            refresh_catalog: args.refresh_catalog,
            normalizer: NormalizerConfig {
                include_stopwords: args.include_stopwords,
            },
        }))
    }

    /// Remote location of a book's plain text
    pub fn text_url(&self, id: BookId) -> String {
        format!("{}/{id}/pg{id}.txt", self.text_base_url)
    }

    /// Local location of a book's plain text
    pub fn text_path(&self, id: BookId) -> PathBuf {
        (self.cache_dir.join("epub"))
            .join(id.to_string())
            .join(format!("pg{id}.txt"))
    }

    /// Local location of the catalog
    pub fn catalog_path(&self) -> PathBuf {
        self.cache_dir.join("pg_catalog.csv.gz")
    }

    /// Local location of the word frequency table
    pub fn frequencies_path(&self) -> PathBuf {
        self.cache_dir.join("frequencies.csv")
    }

    /// Local location of the last bulk processing failure report
    pub fn failures_path(&self) -> PathBuf {
        self.cache_dir.join("failures.tsv")
    }

    /// Configuration that points to a local test server
    #[cfg(test)]
    pub fn for_tests(cache_dir: &Path, server_uri: &str) -> Arc<Self> {
        Arc::new(Self {
            cache_dir: cache_dir.into(),
            text_base_url: format!("{server_uri}/epub").into(),
            catalog_url: format!("{server_uri}/feeds/pg_catalog.csv.gz").into(),
            fetch_timeout: Duration::from_secs(5),
            offline: false,
            refresh_catalog: false,
            normalizer: NormalizerConfig::default(),
        })
    }
}

/// HTTP client that enforces the configured timeout
pub fn http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.fetch_timeout)
        .build()
        .context("setting up the HTTP client")
}

/// Platform-specific cache directory
fn default_cache_dir() -> Result<Box<Path>> {
    let dirs = ProjectDirs::from("", "", env!("CARGO_PKG_NAME"))
        .context("determining the cache's location")?;
    Ok(dirs.cache_dir().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_gutenberg_locations() {
        let config = Config::for_tests(Path::new("/cache"), "http://mirror");
        let id = BookId::new(2701).unwrap();
        assert_eq!(config.text_url(id), "http://mirror/epub/2701/pg2701.txt");
        assert_eq!(
            config.text_path(id),
            Path::new("/cache/epub/2701/pg2701.txt")
        );
        assert_eq!(
            config.frequencies_path(),
            Path::new("/cache/frequencies.csv")
        );
    }
}
