//! Project Gutenberg catalog
//!
//! The catalog is provided as a gzipped CSV file with one row per book. It is
//! downloaded once, kept in compressed form in the cache directory, and
//! decoded on each use.

use crate::{
    config::Config,
    progress::{ProgressReport, Work},
    BookId, Result,
};
use anyhow::Context;
use async_compression::tokio::bufread::GzipDecoder;
use csv_async::AsyncReaderBuilder;
use futures::{StreamExt, TryStreamExt};
use reqwest::Response;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::Path,
};
use tokio::{
    fs::{self, File},
    io::BufReader,
};
use tokio_util::io::StreamReader;

/// Catalog entry
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq)]
pub struct Book {
    /// Book identifier
    #[serde(rename = "Text#")]
    pub id: BookId,

    /// Kind of resource, only "Text" entries have a plain text edition
    #[serde(rename = "Type")]
    pub kind: Box<str>,

    /// Date at which the book was added to Project Gutenberg
    #[serde(rename = "Issued")]
    pub issued: Box<str>,

    /// Book title
    #[serde(rename = "Title")]
    pub title: Box<str>,

    /// Language codes, separated by semicolons
    #[serde(rename = "Language")]
    pub language: Box<str>,

    /// Authors, separated by semicolons
    #[serde(rename = "Authors")]
    pub authors: Box<str>,

    /// Library of Congress subject headings, separated by semicolons
    #[serde(rename = "Subjects")]
    pub subjects: Box<str>,

    /// Library of Congress classification
    #[serde(rename = "LoCC")]
    pub locc: Box<str>,

    /// Project Gutenberg bookshelves, separated by semicolons
    #[serde(rename = "Bookshelves")]
    pub bookshelves: Box<str>,
}
//
impl Book {
    /// Truth that this book should have a plain text edition
    pub fn is_text(&self) -> bool {
        &*self.kind == "Text"
    }
}

/// Book catalog, sorted by id
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Catalog(BTreeMap<BookId, Book>);
//
impl Catalog {
    /// Catalog with no books
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the catalog, downloading it if necessary and allowed
    ///
    /// A cached catalog is downloaded again if the configuration asks for it,
    /// or if it turns out to be empty.
    pub async fn load(
        config: &Config,
        client: &reqwest::Client,
        report: &ProgressReport,
    ) -> Result<Self> {
        let path = config.catalog_path();
        let cached = match fs::metadata(&path).await {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e).context("looking for a cached catalog"),
        };

        // Use the cached catalog if we can
        if config.offline {
            if !cached {
                log::warn!("No cached catalog and network access is disabled, book titles are unknown");
                return Ok(Self::empty());
            }
            return Self::parse(&path).await;
        }
        if cached && !config.refresh_catalog {
            let catalog = Self::parse(&path).await?;
            if !catalog.is_empty() {
                return Ok(catalog);
            }
            log::warn!("Cached catalog is empty, downloading it again");
        }

        // Otherwise, download it first
        download(config, client, report).await?;
        Self::parse(&path).await
    }

    /// Decode a gzipped CSV catalog
    pub async fn parse(path: &Path) -> Result<Self> {
        let context = || format!("decoding the catalog at {}", path.display());
        let file = File::open(path).await.with_context(context)?;
        let csv_bytes = GzipDecoder::new(BufReader::new(file));
        let books = AsyncReaderBuilder::new()
            .has_headers(true)
            .create_deserializer(csv_bytes)
            .into_deserialize::<Book>()
            .try_collect::<Vec<_>>()
            .await
            .with_context(context)?;
        let catalog = books.into_iter().collect::<Self>();
        log::debug!("Loaded {} books from the catalog", catalog.len());
        Ok(catalog)
    }

    /// Look up a book
    pub fn get(&self, id: BookId) -> Option<&Book> {
        self.0.get(&id)
    }

    /// Look up a book's title
    pub fn title(&self, id: BookId) -> Option<&str> {
        self.get(id).map(|book| &*book.title)
    }

    /// Number of books in the catalog
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Truth that the catalog has no books
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Books that should have a plain text edition, by increasing id
    pub fn text_books(&self) -> impl Iterator<Item = &Book> + '_ {
        self.0.values().filter(|book| book.is_text())
    }
}
//
impl FromIterator<Book> for Catalog {
    fn from_iter<I: IntoIterator<Item = Book>>(iter: I) -> Self {
        Self(iter.into_iter().map(|book| (book.id, book)).collect())
    }
}

/// Download the catalog into the cache directory
async fn download(config: &Config, client: &reqwest::Client, report: &ProgressReport) -> Result<()> {
    // Start the download
    let url = &*config.catalog_url;
    let context = || format!("downloading the catalog from {url}");
    log::info!("Downloading the catalog from {url}");
    let response = client
        .get(url)
        .send()
        .await
        .and_then(Response::error_for_status)
        .with_context(context)?;
    let bytes = report.add(
        "Downloading the catalog",
        Work::Bytes(response.content_length()),
    );

    // Stream it into a temporary file
    let tracker = bytes.clone();
    let mut body = StreamReader::new(response.bytes_stream().map(move |res| {
        res
            // Track how many bytes have been downloaded so far
            .inspect(|block| tracker.make_progress(block.len() as u64))
            // Translate reqwest errors into I/O errors
            .map_err(|e| io::Error::new(ErrorKind::Other, e))
    }));
    let path = config.catalog_path();
    fs::create_dir_all(&config.cache_dir)
        .await
        .context("creating the cache directory")?;
    let temp_path = path.with_extension("gz.part");
    let mut file = File::create(&temp_path).await.with_context(context)?;
    let copied = tokio::io::copy(&mut body, &mut file).await;
    bytes.finish();
    copied.with_context(context)?;
    file.sync_all().await.with_context(context)?;
    drop(file);

    // Replace the previous catalog, if any
    fs::rename(&temp_path, &path)
        .await
        .context("replacing the cached catalog")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::write::GzipEncoder;
    use tokio::io::AsyncWriteExt;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const CSV: &str = "\
Text#,Type,Issued,Title,Language,Authors,Subjects,LoCC,Bookshelves
11,Text,2008-06-27,Alice's Adventures in Wonderland,en,\"Carroll, Lewis, 1832-1898\",Fantasy fiction,PR,Children's Literature
12,Sound,2008-06-27,Through the Looking-Glass (audio),en,\"Carroll, Lewis, 1832-1898\",,,
2701,Text,2001-07-01,\"Moby Dick; Or, The Whale\",en,\"Melville, Herman, 1819-1891\",\"Whaling -- Fiction; Sea stories\",PS,Best Books Ever Listings
";

    fn id(raw: u32) -> BookId {
        BookId::new(raw).unwrap()
    }

    async fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(text.as_bytes()).await.unwrap();
        encoder.shutdown().await.unwrap();
        encoder.into_inner()
    }

    #[tokio::test]
    async fn parses_gzipped_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_catalog.csv.gz");
        std::fs::write(&path, gzip(CSV).await).unwrap();

        let catalog = Catalog::parse(&path).await.unwrap();
        assert_eq!(catalog.len(), 3);
        let moby_dick = catalog.get(id(2701)).unwrap();
        assert_eq!(&*moby_dick.title, "Moby Dick; Or, The Whale");
        assert_eq!(&*moby_dick.authors, "Melville, Herman, 1819-1891");
        assert_eq!(catalog.title(id(12)), Some("Through the Looking-Glass (audio)"));
        assert_eq!(catalog.title(id(13)), None);
        let texts = catalog.text_books().map(|book| book.id.get()).collect::<Vec<_>>();
        assert_eq!(texts, [11, 2701]);
    }

    #[tokio::test]
    async fn downloads_when_missing_then_reuses_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feeds/pg_catalog.csv.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(gzip(CSV).await))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_tests(dir.path(), &server.uri());
        let client = crate::config::http_client(&config).unwrap();
        let report = ProgressReport::hidden();

        let downloaded = Catalog::load(&config, &client, &report).await.unwrap();
        assert_eq!(downloaded.len(), 3);
        assert!(config.catalog_path().exists());
        let cached = Catalog::load(&config, &client, &report).await.unwrap();
        assert_eq!(cached, downloaded);
        server.verify().await;
    }

    #[tokio::test]
    async fn offline_without_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path(), "http://127.0.0.1:9");
        std::sync::Arc::make_mut(&mut config).offline = true;
        let client = crate::config::http_client(&config).unwrap();
        let catalog = Catalog::load(&config, &client, &ProgressReport::hidden())
            .await
            .unwrap();
        assert!(catalog.is_empty());
    }
}
