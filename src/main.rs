//! Word frequency explorer for Project Gutenberg books
//!
//! Book texts are downloaded from Project Gutenberg on first use and cached
//! locally, along with the word counts that were computed from them. You can
//! then ask which words are most frequent in a book, or in which known books a
//! word is most frequent.

mod bulk;
mod cache;
mod catalog;
mod config;
mod locks;
mod normalize;
mod output;
mod progress;
mod query;
mod store;
mod top;

use crate::{
    catalog::Catalog,
    config::Config,
    output::Format,
    progress::ProgressReport,
    query::QueryEngine,
    store::FrequencyStore,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use log::LevelFilter;
use std::{
    io::IsTerminal,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    sync::Arc,
};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

/// Explore word frequencies in Project Gutenberg books
///
/// Word counts are computed once per book and kept in a local cache, along
/// with the book texts and the Project Gutenberg catalog.
#[derive(Parser, Debug)]
#[command(version, author)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Directory where book texts, the catalog and word counts are kept
    ///
    /// Defaults to the platform-specific cache directory of this program.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Timeout of network requests, in seconds
    #[arg(long, global = true, default_value = "60")]
    timeout: NonZeroU64,

    /// Never access the network, only use local data
    #[arg(long, global = true)]
    offline: bool,

    /// Download the catalog again even if a copy is cached
    #[arg(long, global = true)]
    refresh_catalog: bool,

    /// Count common English words like "the" or "and"
    ///
    /// Word counts that are already cached are not affected, use `query
    /// --reprocess` to recompute them.
    #[arg(long, global = true)]
    include_stopwords: bool,

    /// Log debug messages
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Base URL of the Project Gutenberg plain text mirror
    #[arg(long, global = true, hide = true, default_value = config::DEFAULT_TEXT_BASE_URL)]
    text_base_url: Box<str>,

    /// URL of the Project Gutenberg catalog
    #[arg(long, global = true, hide = true, default_value = config::DEFAULT_CATALOG_URL)]
    catalog_url: Box<str>,
}
//
impl Args {
    /// Decode and validate CLI arguments
    pub fn parse_and_check() -> Result<Self> {
        // Decode CLI arguments
        let args = Args::parse();

        // Check CLI arguments for basic sanity
        match &args.command {
            Command::Query { query, .. } => {
                anyhow::ensure!(!query.trim().is_empty(), "query should not be empty");
                anyhow::ensure!(
                    !query.trim().contains(char::is_whitespace),
                    "word queries should target a single word"
                );
            }
            Command::Bulk { .. } | Command::Forget { .. } => {}
        }
        Ok(args)
    }
}

/// Operation to be carried out
#[derive(Subcommand, Debug)]
enum Command {
    /// Most frequent words of a book, or books where a word is most frequent
    ///
    /// Word queries only consider books that were processed before, either by
    /// a book query or by bulk processing.
    Query {
        /// Book identifier (e.g. 2701) or word (e.g. whale)
        query: Box<str>,

        /// Maximal number of results
        #[arg(short, long)]
        limit: Option<NonZeroUsize>,

        /// Output CSV instead of a table
        #[arg(long)]
        csv: bool,

        /// Recompute the word counts of the book even if they are cached
        #[arg(long)]
        reprocess: bool,
    },

    /// Compute the word counts of many books
    ///
    /// Failures are reported in a failures.tsv file within the cache
    /// directory. Press Ctrl+C to stop starting new books.
    Bulk {
        /// Identifiers of the books to be processed
        ///
        /// Defaults to the first text books of the catalog.
        ids: Vec<BookId>,

        /// Number of catalog books to be processed, if no ids are specified
        #[arg(short = 'n', long, default_value = "20")]
        count: NonZeroUsize,

        /// Number of books to be processed concurrently
        ///
        /// Defaults to the number of available CPU threads.
        #[arg(short, long)]
        jobs: Option<NonZeroUsize>,
    },

    /// Forget the word counts of some books
    ///
    /// Book texts stay cached, so the counts can be recomputed without network
    /// access. Words are still known afterwards, they just do not appear in
    /// these books anymore.
    Forget {
        /// Identifiers of the books to be forgotten
        #[arg(required = true)]
        ids: Vec<BookId>,
    },
}

/// What a query targets
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum QueryTarget<'query> {
    /// Most frequent words of a book
    Book(BookId),

    /// Books where a word is most frequent
    Word(&'query str),
}
//
impl<'query> QueryTarget<'query> {
    /// Tell book identifiers from words
    ///
    /// Queries made only of ASCII digits are book identifiers, and must be
    /// valid ones. Anything else is a word.
    fn parse(query: &'query str) -> Result<Self> {
        let query = query.trim();
        if !query.is_empty() && query.bytes().all(|b| b.is_ascii_digit()) {
            let id = query
                .parse::<BookId>()
                .with_context(|| format!("{query} is not a valid book identifier"))?;
            Ok(Self::Book(id))
        } else {
            Ok(Self::Word(query))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Decode CLI arguments
    let args = Args::parse_and_check()?;

    // Set up logging
    setup_logging(args.verbose).map_err(|e| anyhow::format_err!("{e}"))?;

    // Set up shared infrastructure
    let config = Config::new(&args)?;
    let client = config::http_client(&config)?;
    let report = ProgressReport::new();
    let store = Arc::new(FrequencyStore::open(config.frequencies_path()).await?);
    let engine = Arc::new(QueryEngine::new(config.clone(), client.clone(), store.clone()));
    let env = Env {
        config,
        client,
        report,
        engine,
    };

    // Run the command, then save word counts no matter what happened
    let result = match args.command {
        Command::Query {
            query,
            limit,
            csv,
            reprocess,
        } => {
            let format = if csv { Format::Csv } else { Format::Table };
            match QueryTarget::parse(&query) {
                Ok(QueryTarget::Book(id)) => query_book(&env, id, limit, format, reprocess).await,
                Ok(QueryTarget::Word(word)) => query_word(&env, word, limit, format).await,
                Err(e) => Err(e),
            }
        }
        Command::Bulk { ids, count, jobs } => bulk_ingest(&env, ids, count, jobs).await,
        Command::Forget { ids } => {
            for id in ids {
                if env.engine.forget(id).await {
                    log::info!("Forgot the word counts of book {id}");
                } else {
                    log::warn!("Book {id} was not processed, nothing to forget");
                }
            }
            Ok(())
        }
    };
    let flushed = store.flush().await;
    result?;
    if flushed? {
        log::debug!(
            "Saved the word counts of {} books to {}",
            store.num_columns(),
            env.config.frequencies_path().display()
        );
    }
    Ok(())
}

/// Shared state of command implementations
struct Env {
    /// Process configuration
    config: Arc<Config>,

    /// HTTP client, used for catalog downloads
    client: reqwest::Client,

    /// Progress report
    report: ProgressReport,

    /// Query processor
    engine: Arc<QueryEngine>,
}
//
impl Env {
    /// Load the catalog, only warning if it is not available
    async fn catalog_or_empty(&self) -> Catalog {
        Catalog::load(&self.config, &self.client, &self.report)
            .await
            .unwrap_or_else(|e| {
                log::warn!("Failed to load the catalog, book titles are unknown: {e:#}");
                Catalog::empty()
            })
    }
}

/// Display the most frequent words of a book
async fn query_book(
    env: &Env,
    id: BookId,
    limit: Option<NonZeroUsize>,
    format: Format,
    reprocess: bool,
) -> Result<()> {
    if reprocess {
        env.engine.reprocess(id).await?;
    }
    let words = env.engine.top_words(id, limit).await?;
    let heading = match format {
        Format::Table => {
            let catalog = env.catalog_or_empty().await;
            let title = catalog.title(id).unwrap_or_default();
            if title.is_empty() {
                format!("Book {id}")
            } else {
                format!("{title} (book {id})")
            }
        }
        Format::Csv => String::new(),
    };
    let mut stdout = BufWriter::new(tokio::io::stdout());
    output::write_words(&mut stdout, &heading, &words, format).await
}

/// Display the books where a word is most frequent
async fn query_word(
    env: &Env,
    word: &str,
    limit: Option<NonZeroUsize>,
    format: Format,
) -> Result<()> {
    let catalog = env.catalog_or_empty().await;

    // Offer to process the whole catalog first
    if !env.config.offline && !catalog.is_empty() && std::io::stdin().is_terminal() {
        let ids = catalog.text_books().map(|book| book.id).collect::<Vec<_>>();
        let ingest = Confirm::new()
            .with_prompt(format!(
                "Process all {} catalog books before searching? This can take a long time",
                ids.len()
            ))
            .default(false)
            .interact()
            .context("asking whether the catalog should be processed")?;
        if ingest {
            let bulk = bulk::run(
                env.engine.clone(),
                ids,
                default_jobs(),
                ctrl_c_token(),
                &env.report,
            )
            .await;
            bulk::write_failures(&env.config.failures_path(), &bulk.failures).await?;
        }
    }

    let books = env.engine.top_books(word, limit, &catalog);
    if books.is_empty() {
        log::info!("Word {word:?} was not found in any processed book");
    }
    let mut stdout = BufWriter::new(tokio::io::stdout());
    output::write_books(&mut stdout, word, &books, format).await
}

/// Compute the word counts of many books
async fn bulk_ingest(
    env: &Env,
    ids: Vec<BookId>,
    count: NonZeroUsize,
    jobs: Option<NonZeroUsize>,
) -> Result<()> {
    let ids = if ids.is_empty() {
        let catalog = Catalog::load(&env.config, &env.client, &env.report).await?;
        anyhow::ensure!(
            !catalog.is_empty(),
            "no book ids were specified and the catalog is not available"
        );
        (catalog.text_books().take(count.get()))
            .map(|book| book.id)
            .collect()
    } else {
        ids
    };

    let bulk = bulk::run(
        env.engine.clone(),
        ids,
        jobs.unwrap_or_else(default_jobs),
        ctrl_c_token(),
        &env.report,
    )
    .await;
    let failures_path = env.config.failures_path();
    bulk::write_failures(&failures_path, &bulk.failures).await?;

    let mut summary = format!(
        "Processed {} books ({} new, {} already known), {} failed",
        bulk.succeeded(),
        bulk.computed,
        bulk.cached,
        bulk.failures.len()
    );
    if bulk.skipped > 0 {
        summary.push_str(&format!(", {} skipped", bulk.skipped));
    }
    if !bulk.failures.is_empty() {
        summary.push_str(&format!(", see {}", failures_path.display()));
    }
    summary.push('\n');
    let mut stdout = BufWriter::new(tokio::io::stdout());
    stdout.write_all(summary.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

/// Default number of concurrent bulk processing jobs
fn default_jobs() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

/// Cancellation token that is triggered by Ctrl+C
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Received Ctrl+C, finishing books that are being processed");
            trigger.cancel();
        }
    });
    token
}

/// Use anyhow for Result type erasure
pub use anyhow::Result;

/// Project Gutenberg book identifier
pub type BookId = NonZeroU32;

/// Number of occurences of a word
///
/// Some very common words appear hundreds of thousands of times across a
/// large set of books, so u64 is used to be safe.
pub type Count = NonZeroU64;

/// Normalized (lowercase) word
pub type Word = Box<str>;

/// Addition operator for NonZeroU64
pub fn add_nz_u64(x: NonZeroU64, y: NonZeroU64) -> NonZeroU64 {
    x.checked_add(y.get())
        .expect("overflow while adding NonZeroU64s")
}

/// Set up logging
fn setup_logging(verbose: bool) -> syslog::Result<()> {
    syslog::init(
        syslog::Facility::LOG_USER,
        if cfg!(feature = "log-trace") {
            LevelFilter::Trace
        } else if cfg!(debug_assertions) || verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
        None,
    )
}
