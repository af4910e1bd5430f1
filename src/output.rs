//! Display of query results

use crate::{query::BookHit, top::Ranked, Result, Word};
use csv_async::AsyncWriterBuilder;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Output format
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Format {
    /// Heading line followed by an aligned table
    Table,

    /// CSV with a header row, without heading line
    Csv,
}

/// Display the most frequent words of a book
pub async fn write_words(
    out: &mut (impl AsyncWrite + Unpin),
    heading: &str,
    words: &[Ranked<Word>],
    format: Format,
) -> Result<()> {
    let rows = words
        .iter()
        .map(|entry| [entry.key.to_string(), entry.score.to_string()])
        .collect::<Vec<_>>();
    write_rows(out, heading, ["word", "count"], &rows, format).await
}

/// Display the books where a word is most frequent
pub async fn write_books(
    out: &mut (impl AsyncWrite + Unpin),
    heading: &str,
    books: &[BookHit],
    format: Format,
) -> Result<()> {
    let rows = books
        .iter()
        .map(|hit| [hit.id.to_string(), hit.title.to_string(), hit.count.to_string()])
        .collect::<Vec<_>>();
    write_rows(out, heading, ["id", "title", "count"], &rows, format).await
}

/// Display a table in the requested format
async fn write_rows<const N: usize>(
    out: &mut (impl AsyncWrite + Unpin),
    heading: &str,
    header: [&str; N],
    rows: &[[String; N]],
    format: Format,
) -> Result<()> {
    match format {
        Format::Csv => {
            let mut writer = AsyncWriterBuilder::new().create_writer(&mut *out);
            writer.write_record(header).await?;
            for row in rows {
                writer.write_record(row).await?;
            }
            writer.flush().await?;
        }
        Format::Table => {
            // Every column is as wide as its widest cell, except the last one
            // which does not need padding
            let mut widths = header.map(|name| name.chars().count());
            for row in rows {
                for (width, cell) in widths.iter_mut().zip(row) {
                    *width = (*width).max(cell.chars().count());
                }
            }
            let mut text = format!("{heading}\n");
            let mut push_line = |cells: [&str; N]| {
                let mut line = String::new();
                for (idx, (cell, width)) in cells.iter().zip(widths).enumerate() {
                    if idx == N - 1 {
                        line.push_str(cell);
                    } else {
                        line.push_str(&format!("{cell:<width$}  "));
                    }
                }
                text.push_str(line.trim_end());
                text.push('\n');
            };
            push_line(header);
            for row in rows {
                push_line(row.each_ref().map(String::as_str));
            }
            out.write_all(text.as_bytes()).await?;
        }
    }
    out.flush().await?;
    Ok(())
}
