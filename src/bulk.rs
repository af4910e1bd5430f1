//! Bulk ingestion of many books

use crate::{
    progress::{ProgressReport, Work},
    query::{Ingestion, QueryEngine, QueryError},
    BookId, Result,
};
use anyhow::Context;
use std::{collections::HashMap, future::Future, num::NonZeroUsize, path::Path, sync::Arc};
use tokio::{
    io::{AsyncWriteExt, BufWriter},
    sync::Semaphore,
    task::{self, JoinSet},
};
use tokio_util::sync::CancellationToken;

/// Outcome of a bulk ingestion run
#[derive(Debug, Default)]
pub struct BulkReport {
    /// Number of books whose word counts were computed
    pub computed: usize,

    /// Number of books whose word counts were already known
    pub cached: usize,

    /// Books that could not be processed, by increasing id
    pub failures: Vec<QueryError>,

    /// Number of books that were not processed due to cancellation
    pub skipped: usize,
}
//
impl BulkReport {
    /// Number of books whose word counts are now known
    pub fn succeeded(&self) -> usize {
        self.computed + self.cached
    }
}

/// Make sure that the word counts of many books are known
///
/// At most `jobs` books are processed concurrently. Failing books are recorded
/// in the report and do not stop the others. Once `cancel` is triggered, no
/// new book is started, but books that are being processed are finished.
pub async fn run(
    engine: Arc<QueryEngine>,
    ids: Vec<BookId>,
    jobs: NonZeroUsize,
    cancel: CancellationToken,
    report: &ProgressReport,
) -> BulkReport {
    log::info!("Processing {} books with {jobs} concurrent jobs", ids.len());
    let books = report.add("Processing books", Work::Steps(ids.len()));
    let slots = Arc::new(Semaphore::new(jobs.get()));
    let mut bulk = BulkReport::default();

    // Start processing books as job slots free up
    let mut jobs = Jobs::new();
    let mut ids = ids.into_iter();
    for id in ids.by_ref() {
        let slot = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                bulk.skipped = 1;
                break;
            }
            slot = slots.clone().acquire_owned() => {
                slot.expect("the job semaphore should never be closed")
            }
        };
        let engine = engine.clone();
        let books = books.clone();
        jobs.spawn(id, async move {
            let result = engine.ingest(id).await;
            books.make_progress(1);
            drop(slot);
            result
        });
    }
    bulk.skipped += ids.len();
    if bulk.skipped > 0 {
        log::warn!("Cancelled, {} books were not processed", bulk.skipped);
    }

    // Collect results
    while let Some((id, result)) = jobs.join_next().await {
        match result {
            Ok(Ingestion::Cached) => bulk.cached += 1,
            Ok(Ingestion::Computed { .. }) => bulk.computed += 1,
            Err(error) => {
                log::warn!("Failed to process book {id}: {}", describe(&error));
                bulk.failures.push(error);
            }
        }
    }
    books.finish();
    bulk.failures.sort_unstable_by_key(QueryError::book_id);
    log::info!(
        "Processed {} books ({} new), {} failed",
        bulk.succeeded(),
        bulk.computed,
        bulk.failures.len()
    );
    bulk
}

/// Books that are being processed
#[derive(Debug, Default)]
struct Jobs {
    /// Processing tasks
    tasks: JoinSet<(BookId, Result<Ingestion, QueryError>)>,

    /// Book processed by each task, used when a task crashes
    books: HashMap<task::Id, BookId>,
}
//
impl Jobs {
    /// Set up an empty set of jobs
    fn new() -> Self {
        Self::default()
    }

    /// Start processing a book
    fn spawn(
        &mut self,
        id: BookId,
        job: impl Future<Output = Result<Ingestion, QueryError>> + Send + 'static,
    ) {
        let handle = self.tasks.spawn(async move { (id, job.await) });
        self.books.insert(handle.id(), id);
    }

    /// Wait for a book to be processed
    ///
    /// A crashed task is reported as a failure of the book that it was
    /// processing. Returns None once all books have been processed.
    async fn join_next(&mut self) -> Option<(BookId, Result<Ingestion, QueryError>)> {
        let (task_id, outcome) = match self.tasks.join_next_with_id().await? {
            Ok((task_id, (id, result))) => (task_id, (id, result)),
            Err(source) => {
                let task_id = source.id();
                let id = *self
                    .books
                    .get(&task_id)
                    .expect("every task should be associated with a book");
                (task_id, (id, Err(QueryError::Crashed { id, source })))
            }
        };
        self.books.remove(&task_id);
        Some(outcome)
    }
}

/// Write a failure report with one `id<TAB>error` line per failing book
pub async fn write_failures(path: &Path, failures: &[QueryError]) -> Result<()> {
    let context = || format!("writing the failure report to {}", path.display());
    let file = tokio::fs::File::create(path).await.with_context(context)?;
    let mut out = BufWriter::new(file);
    for error in failures {
        let line = format!("{}\t{}\n", error.book_id(), describe(error));
        out.write_all(line.as_bytes()).await.with_context(context)?;
    }
    out.flush().await.with_context(context)?;
    Ok(())
}

/// Single-line description of an error and its causes
fn describe(error: &QueryError) -> String {
    anyhow::Chain::new(error)
        .map(|cause| cause.to_string().replace(char::is_control, " "))
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, store::FrequencyStore};
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const BOOK: &str = "\
*** START OF THE PROJECT GUTENBERG EBOOK SOMETHING ***
Some words and some more words.
*** END OF THE PROJECT GUTENBERG EBOOK SOMETHING ***
";

    fn ids(raw: impl IntoIterator<Item = u32>) -> Vec<BookId> {
        raw.into_iter()
            .map(|raw| BookId::new(raw).unwrap())
            .collect()
    }

    async fn setup(server: &MockServer, dir: &tempfile::TempDir) -> (Arc<FrequencyStore>, Arc<QueryEngine>) {
        let config = Config::for_tests(dir.path(), &server.uri());
        let client = crate::config::http_client(&config).unwrap();
        let store = Arc::new(
            FrequencyStore::open(config.frequencies_path())
                .await
                .unwrap(),
        );
        let engine = Arc::new(QueryEngine::new(config, client, store.clone()));
        (store, engine)
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_batch() {
        let server = MockServer::start().await;
        for id in 1..=5 {
            let status = if id == 3 { 500 } else { 200 };
            Mock::given(method("GET"))
                .and(path(format!("/epub/{id}/pg{id}.txt")))
                .respond_with(ResponseTemplate::new(status).set_body_string(BOOK))
                .expect(1)
                .mount(&server)
                .await;
        }
        let dir = tempfile::tempdir().unwrap();
        let (store, engine) = setup(&server, &dir).await;

        let bulk = run(
            engine,
            ids(1..=5),
            NonZeroUsize::new(2).unwrap(),
            CancellationToken::new(),
            &ProgressReport::hidden(),
        )
        .await;
        assert_eq!(bulk.computed, 4);
        assert_eq!(bulk.cached, 0);
        assert_eq!(bulk.skipped, 0);
        assert_eq!(bulk.failures.len(), 1);
        let error = &bulk.failures[0];
        assert_eq!(error.book_id().get(), 3);
        assert!(error.is_retryable());
        assert_eq!(store.num_columns(), 4);
        assert!(!store.has_column(ids([3])[0]));
        server.verify().await;

        let report = dir.path().join("failures.tsv");
        write_failures(&report, &bulk.failures).await.unwrap();
        let report = std::fs::read_to_string(report).unwrap();
        assert_eq!(report.lines().count(), 1);
        assert!(report.starts_with("3\tfailed to download book 3"), "{report}");
    }

    #[tokio::test]
    async fn known_books_are_not_fetched_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/epub/8/pg8.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BOOK))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let (store, engine) = setup(&server, &dir).await;

        let jobs = NonZeroUsize::new(4).unwrap();
        let report = ProgressReport::hidden();
        let first = run(engine.clone(), ids([8]), jobs, CancellationToken::new(), &report).await;
        assert_eq!(first.computed, 1);
        let second = run(engine, ids([8, 8]), jobs, CancellationToken::new(), &report).await;
        assert_eq!(second.cached, 2);
        assert_eq!(store.snapshot().cell("words", ids([8])[0]).unwrap().get(), 2);
        server.verify().await;
    }

    #[tokio::test]
    async fn cancelled_batch_starts_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BOOK))
            .expect(0)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let (store, engine) = setup(&server, &dir).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let bulk = run(
            engine,
            ids(1..=3),
            NonZeroUsize::new(1).unwrap(),
            cancel,
            &ProgressReport::hidden(),
        )
        .await;
        assert_eq!(bulk.skipped, 3);
        assert_eq!(bulk.succeeded(), 0);
        assert!(bulk.failures.is_empty());
        assert_eq!(store.num_columns(), 0);
        server.verify().await;
    }

    #[tokio::test]
    async fn crashed_jobs_are_failures() {
        let mut jobs = Jobs::new();
        let crashing = ids([4])[0];
        let working = ids([5])[0];
        jobs.spawn(crashing, async move {
            if crashing.get() > 0 {
                panic!("counter overflow");
            }
            Ok::<_, QueryError>(Ingestion::Cached)
        });
        jobs.spawn(working, async { Ok::<_, QueryError>(Ingestion::Cached) });

        let mut outcomes = Vec::new();
        while let Some(outcome) = jobs.join_next().await {
            outcomes.push(outcome);
        }
        outcomes.sort_unstable_by_key(|(id, _)| *id);
        let [(first, crashed), (second, worked)] = &outcomes[..] else {
            panic!("expected two outcomes, got {outcomes:?}");
        };
        assert_eq!((*first, *second), (crashing, working));
        assert!(
            matches!(crashed, Err(QueryError::Crashed { id, .. }) if *id == crashing),
            "{crashed:?}"
        );
        assert_eq!(worked.as_ref().ok(), Some(&Ingestion::Cached));
        assert!(jobs.books.is_empty());
    }
}
