//! # Matcher
//!
//! Case-insensitive multi-phrase containment over comment text.
use std::collections::BTreeSet;
use std::io;
use std::path::Path;

use aho_corasick::{AhoCorasick, BuildError, MatchKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("failed to read phrase file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to build phrase automaton: {0}")]
    Build(#[from] BuildError),
}

/// Reports which banned phrases occur in a text.
///
/// Matching is case-insensitive and substring based: "shady" matches "a shadyish plan".
pub trait PhraseMatcher: Send + Sync {
    /// All distinct phrases, in case-folded form, found anywhere in `text`.
    fn find(&self, text: &str) -> BTreeSet<String>;
}

/// A `PhraseMatcher` built once over an Aho-Corasick automaton.
pub struct AhoCorasickMatcher {
    automaton: AhoCorasick,
    phrases: Vec<String>,
}

impl AhoCorasickMatcher {
    pub fn build<I, S>(phrases: I) -> Result<Self, MatcherError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases: Vec<String> = phrases
            .into_iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        // Overlapping search requires standard semantics.
        let automaton = AhoCorasick::builder()
            .match_kind(MatchKind::Standard)
            .build(&phrases)?;

        Ok(Self { automaton, phrases })
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}

impl PhraseMatcher for AhoCorasickMatcher {
    fn find(&self, text: &str) -> BTreeSet<String> {
        if self.phrases.is_empty() {
            return BTreeSet::new();
        }

        let folded = text.to_lowercase();
        self.automaton
            .find_overlapping_iter(&folded)
            .map(|m| self.phrases[m.pattern().as_usize()].clone())
            .collect()
    }
}

/// Read a phrase file: one phrase per line, blank lines ignored.
pub fn load_phrases(path: impl AsRef<Path>) -> Result<Vec<String>, MatcherError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| MatcherError::Read {
        path: path.display().to_string(),
        source,
    })?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}
