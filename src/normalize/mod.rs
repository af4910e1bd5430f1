//! Conversion of raw book texts into word frequencies
//!
//! Project Gutenberg texts are wrapped into a license header and footer which
//! can be quite long and mention "gutenberg" many times, so these are
//! stripped before counting when they can be located.

pub mod stopwords;

use crate::{add_nz_u64, Count, Word};
use rayon::prelude::*;
use regex::Regex;
use std::{
    collections::{hash_map, HashMap},
    sync::OnceLock,
};

/// Number of occurences of each word within a single book
pub type FrequencyCounts = HashMap<Word, Count>;

/// Marker that precedes the actual book text
pub const START_MARKER: &str = "*** START OF THE PROJECT GUTENBERG";

/// Marker that follows the actual book text
pub const END_MARKER: &str = "*** END OF THE PROJECT GUTENBERG";

/// Length of the one-line title block that starts with [`START_MARKER`], used
/// when that line is not terminated by a newline
const START_LINE_LENGTH: usize = 71;

/// Word counting configuration
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct NormalizerConfig {
    /// Truth that common English stopwords should be counted too
    pub include_stopwords: bool,
}

/// Result of normalizing a book text
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Normalized {
    /// Word frequencies
    pub counts: FrequencyCounts,

    /// Truth that the Gutenberg header and footer were found and stripped
    ///
    /// When this is false, the counts cover the whole text, boilerplate
    /// included.
    pub stripped: bool,
}

/// Count the words of a book text
///
/// The output only depends on the input text and configuration, even though
/// the counting work is spread across the rayon thread pool.
pub fn normalize(text: &str, config: &NormalizerConfig) -> Normalized {
    let (body, stripped) = match strip_header_and_footer(text) {
        Some(body) => (body, true),
        None => (text, false),
    };
    Normalized {
        counts: count_words(body, config),
        stripped,
    }
}

/// Locate the book text between the Gutenberg header and footer
///
/// The line holding the start marker is excluded, as is everything from the
/// end marker onwards. Returns None if either marker cannot be found, or if
/// they are not in the expected order.
pub fn strip_header_and_footer(text: &str) -> Option<&str> {
    let start = text.find(START_MARKER)?;
    let start_line = &text[start..];
    let body_start = match start_line.find('\n') {
        Some(newline) => start + newline + 1,
        None => {
            let offset = (start_line.char_indices())
                .nth(START_LINE_LENGTH)
                .map_or(start_line.len(), |(idx, _char)| idx);
            start + offset
        }
    };
    let body_len = text[body_start..].find(END_MARKER)?;
    Some(&text[body_start..body_start + body_len])
}

/// Count the words of a text, without any header/footer processing
pub fn count_words(text: &str, config: &NormalizerConfig) -> FrequencyCounts {
    // Words never span lines, so lines can be counted independently
    text.par_lines()
        .fold(FrequencyCounts::new, |mut counts, line| {
            for word in tokenize(line, config) {
                match counts.entry(word) {
                    hash_map::Entry::Occupied(o) => {
                        let o = o.into_mut();
                        *o = add_nz_u64(*o, Count::MIN);
                    }
                    hash_map::Entry::Vacant(v) => {
                        v.insert(Count::MIN);
                    }
                }
            }
            counts
        })
        .reduce(FrequencyCounts::new, merge_counts)
}

/// Split a text into lowercase words
///
/// Words are maximal runs of word characters. Runs that only contain digits
/// are numbers, not words, and are dropped along with stopwords (unless the
/// configuration asks to keep those).
pub fn tokenize(text: &str, config: &NormalizerConfig) -> Vec<Word> {
    let lowercase = text.to_lowercase();
    word_regex()
        .find_iter(&lowercase)
        .map(|token| token.as_str())
        .filter(|token| !token.chars().all(char::is_numeric))
        .filter(|token| config.include_stopwords || !stopwords::is_stopword(token))
        .map(Word::from)
        .collect()
}

/// Merge two sets of word counts from the same book
pub fn merge_counts(lhs: FrequencyCounts, rhs: FrequencyCounts) -> FrequencyCounts {
    // Insert the smallest set into the largest one
    let (mut dst, src) = if lhs.len() >= rhs.len() {
        (lhs, rhs)
    } else {
        (rhs, lhs)
    };
    for (word, count) in src {
        match dst.entry(word) {
            hash_map::Entry::Occupied(o) => {
                let o = o.into_mut();
                *o = add_nz_u64(*o, count);
            }
            hash_map::Entry::Vacant(v) => {
                v.insert(count);
            }
        }
    }
    dst
}

/// Regex that matches a run of word characters
fn word_regex() -> &'static Regex {
    static LAZY: OnceLock<Regex> = OnceLock::new();
    LAZY.get_or_init(|| Regex::new(r"\w+").expect("word regex should be valid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts_of(pairs: &[(&str, u64)]) -> FrequencyCounts {
        pairs
            .iter()
            .map(|&(word, count)| (Word::from(word), Count::new(count).unwrap()))
            .collect()
    }

    fn sample_book() -> String {
        [
            "The Project Gutenberg eBook of Moby Dick",
            "",
            "*** START OF THE PROJECT GUTENBERG EBOOK MOBY DICK; OR THE WHALE ***",
            "Call me Ishmael. Some years ago, never mind how long precisely,",
            "having little or no money in my purse, I thought I would sail.",
            "*** END OF THE PROJECT GUTENBERG EBOOK MOBY DICK; OR THE WHALE ***",
            "Project Gutenberg license terms follow.",
        ]
        .join("\n")
    }

    #[test]
    fn counts_words_without_stopwords() {
        let normalized = normalize(
            "The cat sat on the mat. The cat ran.",
            &NormalizerConfig::default(),
        );
        assert_eq!(
            normalized.counts,
            counts_of(&[("cat", 2), ("sat", 1), ("mat", 1), ("ran", 1)])
        );
        assert!(!normalized.stripped);
    }

    #[test]
    fn keeps_stopwords_on_request() {
        let config = NormalizerConfig {
            include_stopwords: true,
        };
        let counts = count_words("The cat sat on the mat. The cat ran.", &config);
        assert_eq!(
            counts,
            counts_of(&[
                ("the", 3),
                ("cat", 2),
                ("sat", 1),
                ("on", 1),
                ("mat", 1),
                ("ran", 1)
            ])
        );
    }

    #[test]
    fn drops_numbers_but_not_words_with_digits() {
        let config = NormalizerConfig {
            include_stopwords: true,
        };
        let words = tokenize("In 1851, 2 WHALES met the 3rd mate_2", &config);
        let words = words.iter().map(|w| &**w).collect::<Vec<_>>();
        assert_eq!(words, ["in", "whales", "met", "the", "3rd", "mate_2"]);
    }

    #[test]
    fn counts_add_up_to_surviving_tokens() {
        let config = NormalizerConfig::default();
        let text = sample_book().repeat(50);
        let counts = count_words(&text, &config);
        let total: u64 = counts.values().map(|count| count.get()).sum();
        let tokens = text
            .lines()
            .map(|line| tokenize(line, &config).len() as u64)
            .sum::<u64>();
        assert_eq!(total, tokens);
        assert!(counts.keys().all(|word| !word.is_empty()));
    }

    #[test]
    fn normalization_is_deterministic() {
        let config = NormalizerConfig::default();
        let text = sample_book().repeat(200);
        assert_eq!(normalize(&text, &config), normalize(&text, &config));
    }

    #[test]
    fn strips_header_and_footer_lines() {
        let book = sample_book();
        let body = strip_header_and_footer(&book).unwrap();
        assert!(body.starts_with("Call me Ishmael."));
        assert!(body.ends_with("I thought I would sail.\n"));
        assert!(!body.contains("START OF"));
        assert!(!body.contains("END OF"));

        let normalized = normalize(&book, &NormalizerConfig::default());
        assert!(normalized.stripped);
        assert!(!normalized.counts.contains_key("gutenberg"));
        assert_eq!(normalized.counts["ishmael"], Count::MIN);
    }

    #[test]
    fn unterminated_start_line_uses_fixed_offset() {
        let header = format!("{START_MARKER} EBOOK {}", "X".repeat(60));
        let text = format!("{header}body text {END_MARKER} ***");
        let start_line_end = header.chars().take(START_LINE_LENGTH).count();
        assert_eq!(start_line_end, START_LINE_LENGTH);
        let body = strip_header_and_footer(&text).unwrap();
        assert_eq!(body, &text[START_LINE_LENGTH..text.find(END_MARKER).unwrap()]);
    }

    #[test]
    fn missing_markers_are_a_degraded_success() {
        let text = "Project Gutenberg presents a whale.";
        assert_eq!(strip_header_and_footer(text), None);
        let normalized = normalize(text, &NormalizerConfig::default());
        assert!(!normalized.stripped);
        assert_eq!(
            normalized.counts,
            counts_of(&[("project", 1), ("gutenberg", 1), ("presents", 1), ("whale", 1)])
        );

        let footer_only = format!("whale\n{END_MARKER}\n");
        assert_eq!(strip_header_and_footer(&footer_only), None);
        let reversed = format!("{END_MARKER}\nwhale\n{START_MARKER}\n");
        assert_eq!(strip_header_and_footer(&reversed), None);
    }

    #[test]
    fn merging_adds_counts() {
        let merged = merge_counts(
            counts_of(&[("whale", 2), ("sea", 1)]),
            counts_of(&[("whale", 3)]),
        );
        assert_eq!(merged, counts_of(&[("whale", 5), ("sea", 1)]));
    }
}
