//! Sparse word/book frequency matrix
//!
//! Rows are all the words that were ever observed in a book, columns are all
//! the books that were processed so far. Most words only appear in a few
//! books, so only non-zero cells are stored, twice: once per book column for
//! book → words lookups and once per word row for word → books lookups.

pub mod persist;

use crate::{
    add_nz_u64,
    normalize::FrequencyCounts,
    top::{self, RankedResult},
    BookId, Count, Result, Word,
};
use anyhow::Context;
use std::{
    collections::{btree_map, hash_map, BTreeMap, HashMap},
    num::NonZeroUsize,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

/// Index of a row of the matrix
type RowId = usize;

/// Sparse word/book frequency matrix
///
/// Rows are never removed or renumbered once created, even if all cells of a
/// row end up empty. Cells that are not stored are zero.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FrequencyMatrix {
    /// Row of each known word
    row_ids: HashMap<Word, RowId>,

    /// Word associated with each row
    words: Vec<Word>,

    /// Non-zero cells of each book column
    columns: BTreeMap<BookId, HashMap<RowId, Count>>,

    /// Non-zero cells of each word row, indexed by RowId
    postings: Vec<BTreeMap<BookId, Count>>,
}
//
impl FrequencyMatrix {
    /// Set up an empty matrix
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known words
    pub fn num_rows(&self) -> usize {
        self.words.len()
    }

    /// Number of processed books
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Truth that a book has been processed
    pub fn has_column(&self, id: BookId) -> bool {
        self.columns.contains_key(&id)
    }

    /// Value of a single cell, None meaning zero
    pub fn cell(&self, word: &str, id: BookId) -> Option<Count> {
        let row = *self.row_ids.get(word)?;
        self.postings[row].get(&id).copied()
    }

    /// Word counts of a book, if it has been processed
    pub fn column(&self, id: BookId) -> Option<FrequencyCounts> {
        let column = self.columns.get(&id)?;
        Some(
            (column.iter())
                .map(|(&row, &count)| (self.words[row].clone(), count))
                .collect(),
        )
    }

    /// Record word counts for a book
    ///
    /// If the book already has a column, the new counts are added to the
    /// existing ones. Use [`replace_column()`](Self::replace_column) when
    /// reprocessing a book.
    pub fn commit_column(&mut self, id: BookId, counts: FrequencyCounts) {
        self.columns.entry(id).or_default();
        for (word, count) in counts {
            let row = self.ensure_row(word);
            self.add_cell(row, id, count);
        }
    }

    /// Record word counts for a book, discarding any previous counts
    pub fn replace_column(&mut self, id: BookId, counts: FrequencyCounts) {
        self.remove_column(id);
        self.commit_column(id, counts);
    }

    /// Forget about a book, returns truth that it had been processed
    ///
    /// Rows are kept even if this leaves them empty.
    pub fn remove_column(&mut self, id: BookId) -> bool {
        let Some(column) = self.columns.remove(&id) else {
            return false;
        };
        for row in column.into_keys() {
            self.postings[row].remove(&id);
        }
        true
    }

    /// Books in which a word appears, by decreasing count then increasing id
    pub fn row(&self, word: &str, limit: Option<NonZeroUsize>) -> RankedResult<BookId> {
        let Some(&row) = self.row_ids.get(word) else {
            return RankedResult::new();
        };
        let cells = (self.postings[row].iter())
            .map(|(&id, &count)| (id, count))
            .collect::<Vec<_>>();
        top::rank(cells, limit)
    }

    /// Most frequent words of a book, by decreasing count then increasing
    /// lexicographic order, or None if the book has not been processed
    pub fn top_column_entries(
        &self,
        id: BookId,
        limit: Option<NonZeroUsize>,
    ) -> Option<RankedResult<Word>> {
        let column = self.columns.get(&id)?;
        let cells = (column.iter())
            .map(|(&row, &count)| (self.words[row].clone(), count))
            .collect::<Vec<_>>();
        Some(top::rank(cells, limit))
    }

    /// Processed books, in increasing id order
    pub fn book_ids(&self) -> impl Iterator<Item = BookId> + '_ {
        self.columns.keys().copied()
    }

    /// Rows of the matrix, in creation order
    pub fn rows(&self) -> impl Iterator<Item = (&str, &BTreeMap<BookId, Count>)> + '_ {
        (self.words.iter())
            .zip(&self.postings)
            .map(|(word, cells)| (&**word, cells))
    }

    /// Row associated with a word, created if needed
    fn ensure_row(&mut self, word: Word) -> RowId {
        match self.row_ids.entry(word) {
            hash_map::Entry::Occupied(o) => *o.get(),
            hash_map::Entry::Vacant(v) => {
                let row = self.words.len();
                self.words.push(v.key().clone());
                self.postings.push(BTreeMap::new());
                v.insert(row);
                row
            }
        }
    }

    /// Add to a cell of an existing row and column
    fn add_cell(&mut self, row: RowId, id: BookId, count: Count) {
        let cell = match self.postings[row].entry(id) {
            btree_map::Entry::Occupied(o) => {
                let o = o.into_mut();
                *o = add_nz_u64(*o, count);
                *o
            }
            btree_map::Entry::Vacant(v) => *v.insert(count),
        };
        self.columns.entry(id).or_default().insert(row, cell);
    }
}

/// Shared handle to the frequency matrix and its on-disk copy
///
/// Can be used from multiple threads. Writers get exclusive access to the
/// matrix, so commits to different books can safely interleave. Callers that
/// need check-then-commit atomicity for a given book must serialize on their
/// side (see [`QueryEngine`](crate::query::QueryEngine)).
#[derive(Debug)]
pub struct FrequencyStore {
    /// Location of the on-disk copy
    path: Box<Path>,

    /// Current matrix
    ///
    /// Flushing works on a snapshot of the matrix, and writers only clone it
    /// if such a snapshot is being held.
    matrix: RwLock<Arc<FrequencyMatrix>>,

    /// Truth that the matrix was modified since the last flush
    dirty: AtomicBool,

    /// Serializes flushes
    flush_lock: tokio::sync::Mutex<()>,
}
//
impl FrequencyStore {
    /// Open the store at a certain location, starting empty if there is
    /// nothing there yet
    pub async fn open(path: impl Into<Box<Path>>) -> Result<Self> {
        let path = path.into();
        let matrix = persist::load(&path)
            .await
            .with_context(|| format!("loading word frequencies from {}", path.display()))?;
        let matrix = match matrix {
            Some(matrix) => {
                log::debug!(
                    "Loaded {} words from {} books out of {}",
                    matrix.num_rows(),
                    matrix.num_columns(),
                    path.display()
                );
                matrix
            }
            None => {
                log::debug!("No word frequencies at {} yet, starting empty", path.display());
                FrequencyMatrix::new()
            }
        };
        Ok(Self {
            path,
            matrix: RwLock::new(Arc::new(matrix)),
            dirty: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Truth that a book was processed
    pub fn has_column(&self, id: BookId) -> bool {
        self.read(|matrix| matrix.has_column(id))
    }

    /// Word counts of a book, None meaning that it was not processed yet
    pub fn get_column(&self, id: BookId) -> Option<FrequencyCounts> {
        self.read(|matrix| matrix.column(id))
    }

    /// Record word counts for a book, adding them to previous ones if any
    pub fn commit_column(&self, id: BookId, counts: FrequencyCounts) {
        log::trace!("Committing {} distinct words for book {id}", counts.len());
        self.write(|matrix| matrix.commit_column(id, counts))
    }

    /// Record word counts for a book, discarding any previous ones
    pub fn replace_column(&self, id: BookId, counts: FrequencyCounts) {
        log::trace!("Replacing counts of book {id} with {} distinct words", counts.len());
        self.write(|matrix| matrix.replace_column(id, counts))
    }

    /// Forget about a book, returns truth that it had been processed
    pub fn remove_column(&self, id: BookId) -> bool {
        self.write(|matrix| matrix.remove_column(id))
    }

    /// Books in which a word appears, by decreasing count then increasing id
    pub fn get_row(&self, word: &str, limit: Option<NonZeroUsize>) -> RankedResult<BookId> {
        self.read(|matrix| matrix.row(word, limit))
    }

    /// Most frequent words of a book, or None if it was not processed yet
    pub fn top_column_entries(
        &self,
        id: BookId,
        limit: Option<NonZeroUsize>,
    ) -> Option<RankedResult<Word>> {
        self.read(|matrix| matrix.top_column_entries(id, limit))
    }

    /// Number of processed books
    pub fn num_columns(&self) -> usize {
        self.read(FrequencyMatrix::num_columns)
    }

    /// Save the matrix to disk if it changed since the last flush
    ///
    /// Returns truth that something was written.
    pub async fn flush(&self) -> Result<bool> {
        let _flushing = self.flush_lock.lock().await;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let snapshot = self.snapshot();
        let result = persist::save(&self.path, &snapshot)
            .await
            .with_context(|| format!("saving word frequencies to {}", self.path.display()));
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result.map(|()| true)
    }

    /// Current state of the matrix
    pub fn snapshot(&self) -> Arc<FrequencyMatrix> {
        self.read_lock().clone()
    }

    /// Run a query against the matrix
    fn read<R>(&self, query: impl FnOnce(&FrequencyMatrix) -> R) -> R {
        query(&self.read_lock())
    }

    /// Modify the matrix
    fn write<R>(&self, update: impl FnOnce(&mut FrequencyMatrix) -> R) -> R {
        let mut matrix = self.matrix.write().unwrap_or_else(PoisonError::into_inner);
        let result = update(Arc::make_mut(&mut matrix));
        self.dirty.store(true, Ordering::Release);
        result
    }

    /// Shared access to the matrix pointer
    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, Arc<FrequencyMatrix>> {
        self.matrix.read().unwrap_or_else(PoisonError::into_inner)
    }
}
