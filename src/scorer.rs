//! Statistical scorer abstraction.
//!
//! The index engine only depends on this narrow contract: build a weighted
//! dictionary from a word-occurrence subset, and score arbitrary text against
//! a dictionary. Alternate weighting strategies can be substituted without
//! touching the pipelines.

use std::collections::BTreeMap;

use crate::models::TagSubset;

pub type Dictionary = BTreeMap<String, f64>;

pub trait Scorer: Send + Sync {
    /// Turn a subset into a weighted dictionary, dropping the lowest-weighted
    /// `compression` fraction of words.
    fn build_dictionary(&self, subset: &TagSubset, compression: f64) -> Dictionary;

    /// Score a pre-analyzed term stream against a dictionary. Terms must use
    /// the same analysis (tokenization, n-gram size) the dictionary was built
    /// from. Returns 0.0 when nothing matches.
    fn score_terms(&self, terms: &[String], dictionary: &Dictionary, multiplier: f64) -> f64;

    /// Score raw text against a unigram dictionary.
    fn score(&self, text: &str, dictionary: &Dictionary, multiplier: f64) -> f64 {
        self.score_terms(&tokenize(text), dictionary, multiplier)
    }
}

/// Reference scorer: a word's weight is its tag-local share of corpus
/// occurrences, damped by log of the tag count so rare-but-repeated words
/// dominate common ones.
#[derive(Debug, Default, Clone)]
pub struct FrequencyScorer;

impl Scorer for FrequencyScorer {
    fn build_dictionary(&self, subset: &TagSubset, compression: f64) -> Dictionary {
        let mut weighted: Vec<(String, f64)> = subset
            .words
            .iter()
            .filter(|(_, stats)| stats.corpus_count > 0 && stats.tag_count > 0)
            .map(|(word, stats)| {
                let share = stats.tag_count as f64 / stats.corpus_count as f64;
                let weight = share * (1.0 + (stats.tag_count as f64).ln());
                (word.clone(), weight)
            })
            .collect();

        if compression > 0.0 && !weighted.is_empty() {
            weighted.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            let keep = ((weighted.len() as f64) * (1.0 - compression)).ceil() as usize;
            weighted.truncate(keep.max(1));
        }

        weighted.into_iter().collect()
    }

    fn score_terms(&self, terms: &[String], dictionary: &Dictionary, multiplier: f64) -> f64 {
        if dictionary.is_empty() {
            return 0.0;
        }
        terms
            .iter()
            .filter_map(|term| dictionary.get(term))
            .sum::<f64>()
            * multiplier
    }
}

/// Lowercased alphanumeric tokens, in input order.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Word n-grams over the token stream, joined by a single space.
/// `n = 1` returns the tokens themselves.
pub fn ngrams(tokens: &[String], n: usize) -> Vec<String> {
    if n <= 1 {
        return tokens.to_vec();
    }
    if tokens.len() < n {
        return Vec::new();
    }
    tokens.windows(n).map(|w| w.join(" ")).collect()
}
