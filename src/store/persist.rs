//! On-disk copy of the frequency matrix
//!
//! Conceptually, the matrix is a wide table with one row per word and one
//! column per book. Book columns are named after the book id with a
//! [`BOOK_COLUMN_PREFIX`], so that no book id can ever collide with the word
//! column. But since most cells are zero, the table is stored in long form, as
//! a CSV file with one record per non-zero cell:
//!
//! - `word,book_<id>,count` is a non-zero cell,
//! - `,book_<id>,` declares a book column, all columns come first,
//! - `word,,` declares a row that has no non-zero cell.

use super::FrequencyMatrix;
use crate::{BookId, Count, Result, Word};
use anyhow::Context;
use csv_async::{AsyncReaderBuilder, AsyncWriterBuilder};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, io::ErrorKind, path::Path};
use tokio::fs::{self, File};

/// Name of the field that holds words
pub const WORD_COLUMN: &str = "word";

/// Name of the field that holds book column names
pub const BOOK_FIELD: &str = "book";

/// Name of the field that holds counts
pub const COUNT_FIELD: &str = "count";

/// Prefix of the columns that hold book counts
pub const BOOK_COLUMN_PREFIX: &str = "book_";

/// Name of the column associated with a book
pub fn column_name(id: BookId) -> String {
    format!("{BOOK_COLUMN_PREFIX}{id}")
}

/// Book associated with a column name, if it is a book column
pub fn parse_column_name(name: &str) -> Option<BookId> {
    name.strip_prefix(BOOK_COLUMN_PREFIX)?.parse().ok()
}

/// Record of the on-disk table
///
/// Field names must match [`WORD_COLUMN`], [`BOOK_FIELD`] and
/// [`COUNT_FIELD`].
#[derive(Debug, Deserialize, Serialize)]
struct Record<'a> {
    /// Word, empty in column declarations
    word: Cow<'a, str>,

    /// Book column name, empty in row declarations
    book: Cow<'a, str>,

    /// Count, empty in declarations
    count: Option<Count>,
}

/// Load a matrix from disk, or return None if there is no file at this path
pub async fn load(path: &Path) -> Result<Option<FrequencyMatrix>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("opening the frequency table"),
    };
    let mut reader = AsyncReaderBuilder::new()
        .has_headers(true)
        .create_deserializer(file);

    // An empty file is an empty matrix, anything else must have our header
    let headers = reader
        .headers()
        .await
        .context("reading the frequency table header")?;
    anyhow::ensure!(
        headers.is_empty() || headers.iter().eq([WORD_COLUMN, BOOK_FIELD, COUNT_FIELD]),
        "frequency table header should be {WORD_COLUMN},{BOOK_FIELD},{COUNT_FIELD}"
    );

    // Load the columns, rows and cells
    let mut matrix = FrequencyMatrix::new();
    let mut records = reader.into_deserialize::<Record<'static>>();
    while let Some(record) = records.next().await {
        let Record { word, book, count } = record.context("reading a frequency table record")?;
        let id = if book.is_empty() {
            None
        } else {
            Some(
                parse_column_name(&book)
                    .with_context(|| format!("decoding frequency table column {book:?}"))?,
            )
        };
        match (word.is_empty(), id, count) {
            // Column declaration
            (true, Some(id), None) => {
                anyhow::ensure!(
                    matrix.columns.insert(id, Default::default()).is_none(),
                    "book {id} is declared twice in the frequency table"
                );
            }

            // Row without non-zero cells
            (false, None, None) => {
                matrix.ensure_row(Word::from(word));
            }

            // Non-zero cell
            (false, Some(id), Some(count)) => {
                anyhow::ensure!(
                    matrix.has_column(id),
                    "book {id} has counts in the frequency table, but was not declared"
                );
                anyhow::ensure!(
                    matrix.cell(&word, id).is_none(),
                    "the count of {word:?} in book {id} appears twice in the frequency table"
                );
                let row = matrix.ensure_row(Word::from(word));
                matrix.add_cell(row, id, count);
            }

            _ => anyhow::bail!(
                "malformed frequency table record {word:?},{book:?},{count:?}"
            ),
        }
    }
    Ok(Some(matrix))
}

/// Save a matrix to disk
///
/// The table is first written to a temporary file, which then replaces the
/// previous version, so that an interrupted save never corrupts the table.
pub async fn save(path: &Path, matrix: &FrequencyMatrix) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .context("creating the frequency table directory")?;
    }
    let temp_path = path.with_extension("csv.tmp");
    let file = File::create(&temp_path)
        .await
        .context("creating the temporary frequency table")?;
    let mut writer = AsyncWriterBuilder::new().create_serializer(file);

    // Declare the columns first...
    for id in matrix.book_ids() {
        let record = Record {
            word: Cow::Borrowed(""),
            book: Cow::Owned(column_name(id)),
            count: None,
        };
        writer
            .serialize(record)
            .await
            .with_context(|| format!("declaring column of book {id}"))?;
    }

    // ...then write down every row, in creation order so that reloading
    // yields the same row numbering
    for (word, cells) in matrix.rows() {
        let context = || format!("writing frequency table row {word:?}");
        if cells.is_empty() {
            let record = Record {
                word: Cow::Borrowed(word),
                book: Cow::Borrowed(""),
                count: None,
            };
            writer.serialize(record).await.with_context(context)?;
        }
        for (&id, &count) in cells {
            let record = Record {
                word: Cow::Borrowed(word),
                book: Cow::Owned(column_name(id)),
                count: Some(count),
            };
            writer.serialize(record).await.with_context(context)?;
        }
    }
    writer.flush().await.context("flushing the frequency table")?;
    drop(writer);

    fs::rename(&temp_path, path)
        .await
        .context("replacing the previous frequency table")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::FrequencyCounts;

    fn id(raw: u32) -> BookId {
        BookId::new(raw).unwrap()
    }

    #[test]
    fn column_names_never_collide_with_words() {
        assert_eq!(column_name(id(42)), "book_42");
        assert_eq!(parse_column_name("book_42"), Some(id(42)));
        assert_eq!(parse_column_name(WORD_COLUMN), None);
        assert_eq!(parse_column_name("42"), None);
        assert_eq!(parse_column_name("book_0"), None);
        assert_eq!(parse_column_name("book_x"), None);
    }

    #[tokio::test]
    async fn missing_file_means_no_matrix() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nothing.csv")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saved_table_only_holds_non_zero_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("frequencies.csv");
        let mut matrix = FrequencyMatrix::new();
        matrix.commit_column(id(10), FrequencyCounts::from([(Word::from("fox"), Count::new(3).unwrap())]));
        matrix.commit_column(id(11), FrequencyCounts::from([(Word::from("dog"), Count::new(2).unwrap())]));
        matrix.commit_column(id(12), Default::default());
        matrix.replace_column(id(11), Default::default());
        save(&path, &matrix).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "word,book,count\n,book_10,\n,book_11,\n,book_12,\nfox,book_10,3\ndog,,\n"
        );
        assert!(!path.with_extension("csv.tmp").exists());

        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, matrix);
        assert!(loaded.has_column(id(12)));
        assert_eq!(loaded.num_rows(), 2);
    }

    #[tokio::test]
    async fn table_size_follows_non_zero_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frequencies.csv");
        let num_books = 200;
        let words_per_book = 20;
        let mut matrix = FrequencyMatrix::new();
        for book in 1..=num_books {
            let counts = (0..words_per_book)
                .map(|word| (Word::from(format!("w{book}x{word}")), Count::MIN))
                .collect::<FrequencyCounts>();
            matrix.commit_column(id(book), counts);
        }
        save(&path, &matrix).await.unwrap();

        // Header, one line per book, one line per non-zero cell
        let num_cells = (num_books * words_per_book) as usize;
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1 + num_books as usize + num_cells);
        assert!(text.len() < 32 * (num_books as usize + num_cells));
        assert_eq!(load(&path).await.unwrap().unwrap(), matrix);
    }

    #[tokio::test]
    async fn empty_file_is_empty_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frequencies.csv");
        save(&path, &FrequencyMatrix::new()).await.unwrap();
        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.num_columns(), 0);
        assert_eq!(loaded.num_rows(), 0);
    }

    #[tokio::test]
    async fn rejects_malformed_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frequencies.csv");
        for bad in [
            "word,book_1\nfox,1\n",
            "word,book,count\n,book_1,\n,book_1,\n",
            "word,book,count\n,1,\n",
            "word,book,count\nfox,book_1,1\n",
            "word,book,count\n,book_1,\nfox,book_1,0\n",
            "word,book,count\n,book_1,\nfox,book_1,many\n",
            "word,book,count\n,book_1,\nfox,book_1,1\nfox,book_1,2\n",
            "word,book,count\n,book_1,3\n",
            "word,book,count\nfox,,3\n",
        ] {
            std::fs::write(&path, bad).unwrap();
            assert!(load(&path).await.is_err(), "{bad:?} should be rejected");
        }
    }
}
