//! End-to-end lifecycle tests: create → prepare → activate → index →
//! recommend → edit → index_partial, all through the public API, with a
//! SQLite database and in-memory document store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use tagsim::config::Config;
use tagsim::docstore::MemoryDocumentStore;
use tagsim::engine::Engine;
use tagsim::error::Error;
use tagsim::models::{
    Document, PrcSettings, Process, ProcessStatus, ServiceKind, ServiceStatus,
};
use tagsim::recommend::RecommendOptions;
use tagsim::simstore::{EdgeKey, SimilarityStore, SqliteSimilarityStore};

fn doc(id: &str, tag: &str, body: &str) -> Document {
    Document {
        id: id.into(),
        tag_id: tag.into(),
        title: None,
        body: body.into(),
        modified_at: Utc::now(),
    }
}

fn settings(tags: &[&str]) -> PrcSettings {
    PrcSettings {
        tag_ids: tags.iter().map(|t| t.to_string()).collect(),
        fields: vec!["body".into()],
        n_gram: 1,
        compression: 0.0,
    }
}

async fn setup() -> (
    tempfile::TempDir,
    Engine,
    Arc<MemoryDocumentStore>,
    SqliteSimilarityStore,
) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted_at(dir.path());
    let pool = tagsim::db::connect(&config).await.unwrap();
    tagsim::migrate::run_migrations(&pool).await.unwrap();
    let documents = Arc::new(MemoryDocumentStore::new());
    let edges = SqliteSimilarityStore::new(pool.clone());
    let engine = Engine::new(config, pool, documents.clone());
    (dir, engine, documents, edges)
}

async fn wait_terminal(engine: &Engine, id: Uuid) -> Process {
    for _ in 0..600 {
        let process = engine.get_process(id).await.unwrap();
        if process.status.is_terminal() {
            return process;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("process {id} never reached a terminal state");
}

async fn run_to_finished(engine: &Engine, process: Process) -> Process {
    let done = wait_terminal(engine, process.id).await;
    assert_eq!(
        done.status,
        ProcessStatus::Finished,
        "process {} ({}) ended with errors {:?}",
        done.id,
        done.kind.as_str(),
        done.errors
    );
    done
}

#[tokio::test]
async fn full_lifecycle_and_incremental_repair() {
    let (_dir, engine, documents, edges) = setup().await;

    // The worked example: d1 and d2 share the rare words, d3 does not (yet).
    documents.upsert(doc("d1", "news", "solar panel subsidy vote"));
    documents.upsert(doc("d2", "news", "solar panel factory opens"));
    documents.upsert(doc("d3", "news", "municipal library renovation"));

    engine
        .create_service(Some("svc"), ServiceKind::Prc, Some("newsroom"))
        .await
        .unwrap();

    let p = engine.prepare("svc", settings(&["news"])).await.unwrap();
    run_to_finished(&engine, p).await;
    assert_eq!(
        engine.get_service("svc").await.unwrap().status,
        ServiceStatus::Prepared
    );

    let p = engine.activate("svc").await.unwrap();
    run_to_finished(&engine, p).await;
    assert_eq!(
        engine.get_service("svc").await.unwrap().status,
        ServiceStatus::Active
    );

    let p = engine.index("svc", None, None).await.unwrap();
    let done = run_to_finished(&engine, p).await;
    assert_eq!(done.percent, 100);

    // d1's neighbors contain d2 but not d3.
    let recs = engine
        .recommend_by_id("svc", "d1", None, 3, &RecommendOptions::default())
        .await
        .unwrap();
    assert!(recs.iter().any(|r| r.document_id == "d2"));
    assert!(!recs.iter().any(|r| r.document_id == "d3"));

    // Edit d3 so it now shares the solar/panel signal.
    documents.upsert(doc("d3", "news", "solar panel library install"));

    let p = engine.index_partial("svc").await.unwrap();
    run_to_finished(&engine, p).await;

    // Forward edges for d3 exist, and the reverse direction was repaired:
    // d1 gained d3 as a neighbor without itself being reindexed.
    let d3_edges = edges
        .read_top_n(&EdgeKey::new("svc", "news", "d3"), None)
        .await
        .unwrap();
    assert!(d3_edges.iter().any(|e| e.neighbor_id == "d1"));

    let recs = engine
        .recommend_by_id("svc", "d1", None, 5, &RecommendOptions::default())
        .await
        .unwrap();
    assert!(recs.iter().any(|r| r.document_id == "d3"));

    // Scores stay sorted descending and the count bound holds.
    assert!(recs.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(recs.len() <= 4);
}

#[tokio::test]
async fn full_build_is_idempotent() {
    let (_dir, engine, documents, edges) = setup().await;
    documents.upsert(doc("d1", "news", "solar panel subsidy vote"));
    documents.upsert(doc("d2", "news", "solar panel factory opens"));
    documents.upsert(doc("d3", "news", "solar grid factory vote"));

    engine
        .create_service(Some("svc"), ServiceKind::Prc, None)
        .await
        .unwrap();
    let p = engine.prepare("svc", settings(&["news"])).await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.activate("svc").await.unwrap();
    run_to_finished(&engine, p).await;

    let p = engine.index("svc", None, None).await.unwrap();
    run_to_finished(&engine, p).await;
    let mut first = Vec::new();
    for id in ["d1", "d2", "d3"] {
        first.push(
            edges
                .read_top_n(&EdgeKey::new("svc", "news", id), None)
                .await
                .unwrap(),
        );
    }

    let p = engine.index("svc", None, None).await.unwrap();
    run_to_finished(&engine, p).await;
    for (i, id) in ["d1", "d2", "d3"].iter().enumerate() {
        let second = edges
            .read_top_n(&EdgeKey::new("svc", "news", id), None)
            .await
            .unwrap();
        assert_eq!(first[i], second, "edge list for {id} changed between runs");
    }
}

#[tokio::test]
async fn partial_maintenance_converges_to_a_full_rebuild() {
    let (_dir, engine, documents, edges) = setup().await;
    documents.upsert(doc("d1", "news", "solar panel subsidy vote"));
    documents.upsert(doc("d2", "news", "solar panel factory opens"));
    documents.upsert(doc("d3", "news", "municipal library renovation"));
    documents.upsert(doc("d4", "news", "library factory vote"));

    engine
        .create_service(Some("svc"), ServiceKind::Prc, None)
        .await
        .unwrap();
    let p = engine.prepare("svc", settings(&["news"])).await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.activate("svc").await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.index("svc", None, None).await.unwrap();
    run_to_finished(&engine, p).await;

    // Edits stay within the prepared vocabulary, so the repair path and a
    // full rebuild score over the same dictionary.
    documents.upsert(doc("d3", "news", "solar panel renovation"));
    documents.upsert(doc("d4", "news", "municipal library vote"));

    let p = engine.index_partial("svc").await.unwrap();
    run_to_finished(&engine, p).await;
    let ids = ["d1", "d2", "d3", "d4"];
    let mut repaired = Vec::new();
    for id in ids {
        repaired.push(
            edges
                .read_top_n(&EdgeKey::new("svc", "news", id), None)
                .await
                .unwrap(),
        );
    }

    // A full rebuild over the same activated dictionary must land on the
    // exact graph the incremental run maintained.
    let p = engine.index("svc", None, None).await.unwrap();
    run_to_finished(&engine, p).await;
    for (i, id) in ids.iter().enumerate() {
        let rebuilt = edges
            .read_top_n(&EdgeKey::new("svc", "news", id), None)
            .await
            .unwrap();
        assert_eq!(repaired[i], rebuilt, "edge list for {id} diverged");
    }
}

#[tokio::test]
async fn documents_stamped_after_the_build_wait_for_the_next_partial_run() {
    let (_dir, engine, documents, edges) = setup().await;
    documents.upsert(doc("d1", "news", "solar panel subsidy"));
    documents.upsert(doc("d2", "news", "solar panel factory"));
    // d3 carries a stamp past the build's recorded timestamp.
    let mut late = doc("d3", "news", "solar panel grid");
    late.modified_at = Utc::now() + chrono::Duration::seconds(60);
    documents.upsert(late);

    engine
        .create_service(Some("svc"), ServiceKind::Prc, None)
        .await
        .unwrap();
    let p = engine.prepare("svc", settings(&["news"])).await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.activate("svc").await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.index("svc", None, None).await.unwrap();
    run_to_finished(&engine, p).await;

    // The full build deferred d3 even though prepare saw its words.
    let d3 = edges
        .read_top_n(&EdgeKey::new("svc", "news", "d3"), None)
        .await
        .unwrap();
    assert!(d3.is_empty());
    let d1 = edges
        .read_top_n(&EdgeKey::new("svc", "news", "d1"), None)
        .await
        .unwrap();
    assert!(!d1.iter().any(|e| e.neighbor_id == "d3"));

    // The next partial pass picks it up, in both directions.
    let p = engine.index_partial("svc").await.unwrap();
    run_to_finished(&engine, p).await;
    let d3 = edges
        .read_top_n(&EdgeKey::new("svc", "news", "d3"), None)
        .await
        .unwrap();
    assert!(d3.iter().any(|e| e.neighbor_id == "d1"));
    let d1 = edges
        .read_top_n(&EdgeKey::new("svc", "news", "d1"), None)
        .await
        .unwrap();
    assert!(d1.iter().any(|e| e.neighbor_id == "d3"));
}

#[tokio::test]
async fn removing_shared_words_drops_both_edge_directions() {
    let (_dir, engine, documents, edges) = setup().await;
    documents.upsert(doc("d1", "news", "solar panel subsidy"));
    documents.upsert(doc("d2", "news", "solar panel factory"));
    documents.upsert(doc("d3", "news", "solar panel grid"));

    engine
        .create_service(Some("svc"), ServiceKind::Prc, None)
        .await
        .unwrap();
    let p = engine.prepare("svc", settings(&["news"])).await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.activate("svc").await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.index("svc", None, None).await.unwrap();
    run_to_finished(&engine, p).await;

    for id in ["d1", "d2"] {
        let list = edges
            .read_top_n(&EdgeKey::new("svc", "news", id), None)
            .await
            .unwrap();
        assert!(list.iter().any(|e| e.neighbor_id == "d3"));
    }

    // d3 loses every shared word.
    documents.upsert(doc("d3", "news", "municipal orchestra season"));

    let p = engine.index_partial("svc").await.unwrap();
    run_to_finished(&engine, p).await;

    // The run pivoted on d3, yet the reverse lists of d1 and d2 no longer
    // reference it, and d3's own list is empty.
    for id in ["d1", "d2"] {
        let list = edges
            .read_top_n(&EdgeKey::new("svc", "news", id), None)
            .await
            .unwrap();
        assert!(!list.iter().any(|e| e.neighbor_id == "d3"));
    }
    let d3 = edges
        .read_top_n(&EdgeKey::new("svc", "news", "d3"), None)
        .await
        .unwrap();
    assert!(d3.is_empty());
}

#[tokio::test]
async fn edge_lists_never_exceed_the_configured_bound() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::rooted_at(dir.path());
    config.indexing.max_neighbors = 2;
    let pool = tagsim::db::connect(&config).await.unwrap();
    tagsim::migrate::run_migrations(&pool).await.unwrap();
    let documents = Arc::new(MemoryDocumentStore::new());
    let edges = SqliteSimilarityStore::new(pool.clone());
    let engine = Engine::new(config, pool, documents.clone());

    for i in 0..6 {
        documents.upsert(doc(&format!("d{i}"), "news", "solar panel subsidy vote"));
    }
    engine
        .create_service(Some("svc"), ServiceKind::Prc, None)
        .await
        .unwrap();
    let p = engine.prepare("svc", settings(&["news"])).await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.activate("svc").await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.index("svc", None, None).await.unwrap();
    run_to_finished(&engine, p).await;

    for i in 0..6 {
        let list = edges
            .read_top_n(&EdgeKey::new("svc", "news", &format!("d{i}")), None)
            .await
            .unwrap();
        assert!(list.len() <= 2, "d{i} holds {} neighbors", list.len());
    }

    // A partial run with an extra similar document must respect the bound
    // through the append/trim repair path too.
    documents.upsert(doc("d6", "news", "solar panel subsidy vote"));
    let p = engine.index_partial("svc").await.unwrap();
    run_to_finished(&engine, p).await;
    for i in 0..7 {
        let list = edges
            .read_top_n(&EdgeKey::new("svc", "news", &format!("d{i}")), None)
            .await
            .unwrap();
        assert!(list.len() <= 2, "d{i} holds {} neighbors", list.len());
    }
}

#[tokio::test]
async fn operations_are_gated_by_service_status() {
    let (_dir, engine, documents, _edges) = setup().await;
    documents.upsert(doc("d1", "news", "solar panel"));

    engine
        .create_service(Some("svc"), ServiceKind::Prc, None)
        .await
        .unwrap();

    // Nothing but prepare is legal on a new service.
    assert!(matches!(
        engine.activate("svc").await,
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        engine.index("svc", None, None).await,
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        engine.index_partial("svc").await,
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        engine
            .recommend_by_id("svc", "d1", None, 3, &RecommendOptions::default())
            .await,
        Err(Error::InvalidState(_))
    ));

    let p = engine.prepare("svc", settings(&["news"])).await.unwrap();
    run_to_finished(&engine, p).await;

    // Prepared still cannot index.
    assert!(matches!(
        engine.index("svc", None, None).await,
        Err(Error::InvalidState(_))
    ));

    let p = engine.activate("svc").await.unwrap();
    run_to_finished(&engine, p).await;

    // Partial before any full index is rejected.
    assert!(matches!(
        engine.index_partial("svc").await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn cancelled_full_build_discards_all_edges() {
    let (_dir, engine, documents, edges) = setup().await;
    for i in 0..200 {
        documents.upsert(doc(
            &format!("d{i}"),
            "news",
            "solar panel subsidy vote factory",
        ));
    }

    engine
        .create_service(Some("svc"), ServiceKind::Prc, None)
        .await
        .unwrap();
    let p = engine.prepare("svc", settings(&["news"])).await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.activate("svc").await.unwrap();
    run_to_finished(&engine, p).await;

    let p = engine.index("svc", None, None).await.unwrap();
    engine.cancel_process(p.id).await.unwrap();
    let done = wait_terminal(&engine, p.id).await;

    if done.status == ProcessStatus::Cancelled {
        // All-or-nothing: nothing survives a cancelled build.
        let remaining = edges
            .read_top_n(&EdgeKey::new("svc", "news", "d0"), None)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    } else {
        // The build won the race; that is a legal outcome too.
        assert_eq!(done.status, ProcessStatus::Finished);
    }
    assert_eq!(
        engine.get_service("svc").await.unwrap().status,
        ServiceStatus::Active
    );
}

#[tokio::test]
async fn deleting_a_service_removes_everything_it_owns() {
    let (_dir, engine, documents, edges) = setup().await;
    documents.upsert(doc("d1", "news", "solar panel"));
    documents.upsert(doc("d2", "news", "solar factory"));

    engine
        .create_service(Some("svc"), ServiceKind::Prc, None)
        .await
        .unwrap();
    let p = engine.prepare("svc", settings(&["news"])).await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.activate("svc").await.unwrap();
    run_to_finished(&engine, p).await;
    let p = engine.index("svc", None, None).await.unwrap();
    run_to_finished(&engine, p).await;

    engine.delete_service("svc").await.unwrap();

    assert!(matches!(
        engine.get_service("svc").await,
        Err(Error::NotFound(_))
    ));
    let remaining = edges
        .read_top_n(&EdgeKey::new("svc", "news", "d1"), None)
        .await
        .unwrap();
    assert!(remaining.is_empty());
}
