//! Recommendation queries over an active service.
//!
//! These read the similarity store and the activation cache only; nothing
//! here mutates service state, so queries run concurrently with each other
//! (but not with index builds, which hold the service `busy`).

use std::collections::HashSet;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::models::{Document, ServiceStatus};
use crate::scorer::{ngrams, tokenize};
use crate::simstore::EdgeKey;

/// One per-query weight: documents matching `query` get their similarity
/// score boosted in proportion to `value`.
#[derive(Debug, Clone)]
pub struct WeightQuery {
    pub query: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RecommendOptions {
    /// Restrict results to documents matching this query.
    pub filter_query: Option<String>,
    pub weights: Vec<WeightQuery>,
    /// Attach full document bodies to the results.
    pub hydrate: bool,
}

#[derive(Debug, Clone)]
pub struct Recommendation {
    pub document_id: String,
    pub score: f64,
    pub document: Option<Document>,
}

/// A dictionary word and its weight, as returned by [`Engine::keywords`].
#[derive(Debug, Clone)]
pub struct KeywordEntry {
    pub word: String,
    pub weight: f64,
}

impl Engine {
    /// Neighbors of one document, by stored similarity. Without filter or
    /// weights this is a cheap top-`count-1` read; with refinement the whole
    /// list is pulled because re-weighting may reorder or exclude entries.
    pub async fn recommend_by_id(
        &self,
        service_id: &str,
        document_id: &str,
        tag_id: Option<&str>,
        count: usize,
        options: &RecommendOptions,
    ) -> Result<Vec<Recommendation>> {
        self.ensure_status(service_id, &[ServiceStatus::Active])
            .await?;

        let resolved;
        let tag_id = match tag_id {
            Some(tag) => tag,
            None => {
                let docs = self
                    .documents
                    .documents_by_ids(&[document_id.to_string()])
                    .await?;
                let doc = docs
                    .first()
                    .ok_or_else(|| Error::NotFound(format!("document {document_id}")))?;
                resolved = doc.tag_id.clone();
                &resolved
            }
        };

        let refined = options.filter_query.is_some() || !options.weights.is_empty();
        let limit = if refined {
            None
        } else {
            Some(count.saturating_sub(1))
        };

        let key = EdgeKey::new(service_id, tag_id, document_id);
        let mut entries = self.similarities.read_top_n(&key, limit).await?;

        if refined {
            let ids: Vec<String> = entries.iter().map(|e| e.neighbor_id.clone()).collect();

            if let Some(query) = &options.filter_query {
                let surviving = self.documents.matching_ids(&ids, query).await?;
                entries.retain(|e| surviving.contains(&e.neighbor_id));
            }

            if !options.weights.is_empty() {
                let total = options.weights.len() as f64;
                let mut matches: Vec<HashSet<String>> =
                    Vec::with_capacity(options.weights.len());
                for weight in &options.weights {
                    matches.push(self.documents.matching_ids(&ids, &weight.query).await?);
                }
                for entry in &mut entries {
                    let fraction: f64 = options
                        .weights
                        .iter()
                        .zip(&matches)
                        .filter(|(_, matched)| matched.contains(&entry.neighbor_id))
                        .map(|(weight, _)| weight.value / total)
                        .sum();
                    if fraction > 0.0 {
                        entry.score = (entry.score + 1.0).powf(1.0 + fraction) - 1.0;
                    }
                }
                entries.sort_by(|a, b| {
                    b.score
                        .total_cmp(&a.score)
                        .then_with(|| a.neighbor_id.cmp(&b.neighbor_id))
                });
            }
        }

        entries.truncate(count);
        self.hydrate(entries, options.hydrate).await
    }

    /// Dictionary keywords of `text`: pick the best-matching tag (or use the
    /// caller's), intersect the tag's dictionary with the text's own terms,
    /// and re-weight that reduced subset. Strict mode drops words weighted
    /// below the average.
    pub async fn keywords(
        &self,
        service_id: &str,
        text: &str,
        tag_id: Option<&str>,
        strict: bool,
    ) -> Result<Vec<KeywordEntry>> {
        self.ensure_status(service_id, &[ServiceStatus::Active])
            .await?;
        let runtime = self.cache.get(service_id).ok_or_else(|| {
            Error::InvalidState(format!("service {service_id} is not activation-cached"))
        })?;

        let terms = ngrams(&tokenize(text), runtime.settings.n_gram as usize);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let tag_id = match tag_id {
            Some(tag) => tag.to_string(),
            None => self
                .best_tag(&runtime, &terms)
                .ok_or_else(|| Error::NotFound("no tag matches the given text".into()))?,
        };
        let tag_runtime = runtime.tags.get(&tag_id).ok_or_else(|| {
            Error::NotFound(format!("tag {tag_id} is not part of service {service_id}"))
        })?;

        // Reduce the subset to the words actually present in the input, then
        // let the scorer re-weight only those.
        let term_set: HashSet<&str> = terms.iter().map(String::as_str).collect();
        let reduced = crate::models::TagSubset {
            words: tag_runtime
                .subset
                .words
                .iter()
                .filter(|(word, _)| term_set.contains(word.as_str()))
                .map(|(word, stats)| (word.clone(), *stats))
                .collect(),
        };
        let dictionary = self
            .scorer
            .build_dictionary(&reduced, runtime.settings.compression);

        let mut entries: Vec<KeywordEntry> = dictionary
            .into_iter()
            .map(|(word, weight)| KeywordEntry { word, weight })
            .collect();
        if strict && !entries.is_empty() {
            let average = entries.iter().map(|e| e.weight).sum::<f64>() / entries.len() as f64;
            entries.retain(|e| e.weight >= average);
        }
        entries.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.word.cmp(&b.word)));
        Ok(entries)
    }

    /// Free-text recommendation: derive keywords, then rank the tag's
    /// documents by the total weight of the keywords each one matches.
    pub async fn recommend(
        &self,
        service_id: &str,
        text: &str,
        count: usize,
        hydrate: bool,
    ) -> Result<Vec<Recommendation>> {
        self.ensure_status(service_id, &[ServiceStatus::Active])
            .await?;
        let runtime = self.cache.get(service_id).ok_or_else(|| {
            Error::InvalidState(format!("service {service_id} is not activation-cached"))
        })?;

        let terms = ngrams(&tokenize(text), runtime.settings.n_gram as usize);
        let Some(tag_id) = self.best_tag(&runtime, &terms) else {
            return Ok(Vec::new());
        };
        let keywords = self.keywords(service_id, text, Some(&tag_id), false).await?;
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self
            .documents
            .document_ids_by_tag(&tag_id, None, None, None)
            .await?;

        let mut scores: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
        for keyword in &keywords {
            let matched = self.documents.matching_ids(&ids, &keyword.word).await?;
            for id in matched {
                *scores.entry(id).or_insert(0.0) += keyword.weight;
            }
        }

        let mut entries: Vec<crate::models::SimilarityEntry> = scores
            .into_iter()
            .map(|(neighbor_id, score)| crate::models::SimilarityEntry { neighbor_id, score })
            .collect();
        entries.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.neighbor_id.cmp(&b.neighbor_id))
        });
        entries.truncate(count);
        self.hydrate(entries, hydrate).await
    }

    fn best_tag(
        &self,
        runtime: &crate::cache::ServiceRuntime,
        terms: &[String],
    ) -> Option<String> {
        let mut best: Option<(String, f64)> = None;
        for (tag_id, tag_runtime) in &runtime.tags {
            let score = self
                .scorer
                .score_terms(terms, &tag_runtime.dictionary, 1.0);
            if score > 0.0 && best.as_ref().is_none_or(|(_, b)| score > *b) {
                best = Some((tag_id.clone(), score));
            }
        }
        best.map(|(tag, _)| tag)
    }

    async fn hydrate(
        &self,
        entries: Vec<crate::models::SimilarityEntry>,
        hydrate: bool,
    ) -> Result<Vec<Recommendation>> {
        let documents = if hydrate {
            let ids: Vec<String> = entries.iter().map(|e| e.neighbor_id.clone()).collect();
            self.documents
                .documents_by_ids(&ids)
                .await?
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect()
        } else {
            std::collections::HashMap::new()
        };

        Ok(entries
            .into_iter()
            .map(|e| {
                let document = documents.get(&e.neighbor_id).cloned();
                Recommendation {
                    document_id: e.neighbor_id,
                    score: e.score,
                    document,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::wait_terminal;
    use crate::index::tests::active_engine;
    use crate::models::{Document, PrcSettings, ProcessStatus};
    use chrono::Utc;

    fn doc(id: &str, tag: &str, body: &str) -> Document {
        Document {
            id: id.into(),
            tag_id: tag.into(),
            title: None,
            body: body.into(),
            modified_at: Utc::now(),
        }
    }

    async fn indexed_engine() -> (
        tempfile::TempDir,
        Engine,
        std::sync::Arc<crate::docstore::MemoryDocumentStore>,
    ) {
        let (dir, engine, docs) = active_engine(&["t1"]).await;
        docs.upsert(doc("d1", "t1", "ferris crab mascot"));
        docs.upsert(doc("d2", "t1", "ferris crab language"));
        docs.upsert(doc("d3", "t1", "ferris systems language"));

        // Re-prepare so the dictionary covers the corpus just seeded.
        engine.deactivate("svc").await.unwrap();
        let p = engine
            .prepare(
                "svc",
                PrcSettings {
                    tag_ids: vec!["t1".into()],
                    fields: vec!["body".into()],
                    n_gram: 1,
                    compression: 0.0,
                },
            )
            .await
            .unwrap();
        wait_terminal(&engine, p.id).await;
        let p = engine.activate("svc").await.unwrap();
        wait_terminal(&engine, p.id).await;
        let p = engine.index("svc", None, None).await.unwrap();
        assert_eq!(
            wait_terminal(&engine, p.id).await.status,
            ProcessStatus::Finished
        );
        (dir, engine, docs)
    }

    #[tokio::test]
    async fn cheap_path_returns_stored_neighbors() {
        let (_dir, engine, _docs) = indexed_engine().await;

        let recs = engine
            .recommend_by_id("svc", "d1", None, 3, &RecommendOptions::default())
            .await
            .unwrap();
        assert!(!recs.is_empty());
        assert!(recs.len() <= 2); // count - 1 neighbors on the cheap path
        assert!(recs.iter().all(|r| r.document.is_none()));
        assert!(recs.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn filter_query_restricts_and_hydration_attaches_documents() {
        let (_dir, engine, _docs) = indexed_engine().await;

        let options = RecommendOptions {
            filter_query: Some("language".into()),
            weights: vec![],
            hydrate: true,
        };
        let recs = engine
            .recommend_by_id("svc", "d1", Some("t1"), 5, &options)
            .await
            .unwrap();
        assert!(recs.iter().all(|r| ["d2", "d3"].contains(&r.document_id.as_str())));
        assert!(recs.iter().all(|r| r.document.is_some()));
    }

    #[tokio::test]
    async fn weights_boost_matching_documents() {
        let (_dir, engine, _docs) = indexed_engine().await;

        let plain = engine
            .recommend_by_id("svc", "d1", Some("t1"), 5, &RecommendOptions::default())
            .await
            .unwrap();
        let options = RecommendOptions {
            filter_query: None,
            weights: vec![WeightQuery {
                query: "systems".into(),
                value: 1.0,
            }],
            hydrate: false,
        };
        let boosted = engine
            .recommend_by_id("svc", "d1", Some("t1"), 5, &options)
            .await
            .unwrap();

        let plain_d3 = plain.iter().find(|r| r.document_id == "d3").unwrap();
        let boosted_d3 = boosted.iter().find(|r| r.document_id == "d3").unwrap();
        assert!(boosted_d3.score > plain_d3.score);

        // score' = (score+1)^(1+fraction) - 1 with fraction = 1.0
        let expected = (plain_d3.score + 1.0).powf(2.0) - 1.0;
        assert!((boosted_d3.score - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn keywords_reduce_to_input_words() {
        let (_dir, engine, _docs) = indexed_engine().await;

        let entries = engine
            .keywords("svc", "ferris the crab goes gardening", None, false)
            .await
            .unwrap();
        let words: Vec<&str> = entries.iter().map(|e| e.word.as_str()).collect();
        assert!(words.contains(&"ferris"));
        assert!(words.contains(&"crab"));
        assert!(!words.contains(&"gardening")); // not in the tag's dictionary
        assert!(entries.windows(2).all(|w| w[0].weight >= w[1].weight));

        let strict = engine
            .keywords("svc", "ferris the crab goes gardening", None, true)
            .await
            .unwrap();
        assert!(strict.len() <= entries.len());
    }

    #[tokio::test]
    async fn text_recommendation_ranks_by_keyword_weight() {
        let (_dir, engine, _docs) = indexed_engine().await;

        let recs = engine.recommend("svc", "ferris crab", 10, false).await.unwrap();
        assert!(!recs.is_empty());
        // d1 and d2 match both keywords, d3 only "ferris".
        let top_ids: Vec<&str> = recs.iter().take(2).map(|r| r.document_id.as_str()).collect();
        assert!(top_ids.contains(&"d1"));
        assert!(top_ids.contains(&"d2"));
    }
}
