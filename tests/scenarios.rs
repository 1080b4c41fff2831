//! End-to-end behaviour of the memory lifecycle

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, FixedIndex, TableEmbedder};
use mne_memory::{
    ConsolidationEngine, Config, Content, EdgeKind, EpisodicMemory, Error, ManualClock, NodeId, NodeStatus,
    NodeStore, QueryFilters, RetrievalPlanner,
};

fn store_with_clock(config: Config) -> (NodeStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = NodeStore::with_clock(config.dimensions(2), clock.clone()).unwrap();
    (store, clock)
}

fn create(store: &NodeStore, clock: &ManualClock, name: &str, embedding: [f32; 2]) -> NodeId {
    let id = store.create(Content::text(name), embedding.to_vec(), vec![]).unwrap();
    clock.advance(Duration::from_secs(1));
    id
}

#[test]
fn near_duplicate_is_merged_into_older_node() {
    init_tracing();
    let (store, clock) = store_with_clock(Config::default().merge_thresholds(0.95, 0.5));
    let engine = ConsolidationEngine::new(store.clone());

    let a = create(&store, &clock, "A", [1.0, 0.0]);
    let b = create(&store, &clock, "B", [0.99, 0.01]);
    let c = create(&store, &clock, "C", [0.0, 1.0]);
    store.graph().link(a, b, EdgeKind::SemanticSimilarity, 0.9).unwrap();

    let report = engine.sweep(Duration::from_secs(1)).unwrap();

    assert_eq!(report.merges.len(), 1);
    assert_eq!((report.merges[0].merged, report.merges[0].survivor), (b, a));
    assert_eq!(store.status(b).unwrap(), Some(NodeStatus::Consolidated));
    assert_eq!(store.status(a).unwrap(), Some(NodeStatus::Active));
    assert_eq!(store.status(c).unwrap(), Some(NodeStatus::Active));
    assert!(store.graph().edges_of(c).unwrap().is_empty());
}

#[tokio::test]
async fn query_returns_at_most_k_and_touches_results() {
    init_tracing();
    let (store, clock) = store_with_clock(Config::default());
    let index = Arc::new(FixedIndex::new());
    let planner = RetrievalPlanner::new(store.clone(), index.clone());

    let ids: Vec<NodeId> = (0..5)
        .map(|i| create(&store, &clock, &format!("N{}", i + 1), [1.0, i as f32 * 0.1]))
        .collect();
    index.answer(vec![(ids[0], 0.9), (ids[1], 0.8), (ids[2], 0.7)]);

    let results = planner.query(&[1.0, 0.0], 2, &QueryFilters::default()).await.unwrap();

    assert!(results.len() <= 2);
    assert_eq!(results.len(), 2);
    for scored in &results {
        assert_eq!(scored.node.access_count, 1);
        assert_eq!(store.get(scored.node.id).unwrap().access_count, 1);
    }
    // untouched nodes keep a zero count
    assert_eq!(store.get(ids[4]).unwrap().access_count, 0);
}

#[test]
fn evicting_a_node_removes_it_from_neighbors() {
    init_tracing();
    let (store, clock) = store_with_clock(Config::default());
    let graph = store.graph();
    let keep = create(&store, &clock, "keep", [1.0, 0.0]);
    let drop = create(&store, &clock, "drop", [0.0, 1.0]);
    graph.link(keep, drop, EdgeKind::CoOccurrence, 0.7).unwrap();
    assert_eq!(graph.neighbors(keep, None, 0.0).unwrap(), vec![(drop, 0.7)]);

    store.evict(drop).unwrap();

    assert!(graph.neighbors(keep, None, 0.0).unwrap().is_empty());
    assert!(graph.edge(keep, drop, EdgeKind::CoOccurrence).unwrap().is_none());
    store.check_consistency().unwrap();
}

#[test]
fn repeated_links_strengthen_one_edge() {
    let (store, clock) = store_with_clock(Config::default());
    let graph = store.graph();
    let a = create(&store, &clock, "a", [1.0, 0.0]);
    let b = create(&store, &clock, "b", [0.0, 1.0]);

    graph.link(a, b, EdgeKind::SemanticSimilarity, 0.3).unwrap();
    graph.link(b, a, EdgeKind::SemanticSimilarity, 0.3).unwrap();

    assert_eq!(graph.edge_count().unwrap(), 1);
    let edge = graph.edge(a, b, EdgeKind::SemanticSimilarity).unwrap().unwrap();
    assert!((edge.weight - 0.6).abs() < 1e-6);
}

#[test]
fn equal_weight_neighbors_prefer_recent_strengthening() {
    let (store, clock) = store_with_clock(Config::default());
    let graph = store.graph();
    let hub = create(&store, &clock, "hub", [1.0, 0.0]);
    let first = create(&store, &clock, "first", [0.0, 1.0]);
    let second = create(&store, &clock, "second", [0.5, 0.5]);

    graph.link(hub, first, EdgeKind::CoOccurrence, 0.5).unwrap();
    graph.link(hub, second, EdgeKind::CoOccurrence, 0.5).unwrap();

    let neighbors: Vec<NodeId> = graph.neighbors(hub, None, 0.0).unwrap().into_iter().map(|(id, _)| id).collect();
    assert_eq!(neighbors, vec![second, first]);
}

#[tokio::test]
async fn facade_remember_recall_and_sweep() {
    init_tracing();
    let embedder = TableEmbedder::new(2)
        .with("kettle whistled", &[1.0, 0.0])
        .with("kettle", &[0.9, 0.1])
        .with("door slammed", &[0.0, 1.0]);
    let clock = Arc::new(ManualClock::starting_now());
    let memory = EpisodicMemory::builder(Config::default().dimensions(2), Arc::new(embedder))
        .clock(clock.clone())
        .build()
        .unwrap();

    let kettle = memory
        .remember(Content::text("kettle whistled"), vec!["kitchen".into()])
        .await
        .unwrap();
    clock.advance(Duration::from_secs(5));
    let door = memory.remember(Content::text("door slammed"), vec![]).await.unwrap();

    let hits = memory.recall(&Content::text("kettle"), 1, &QueryFilters::default()).await.unwrap();
    assert_eq!(hits[0].node.id, kettle);

    // unknown cue: embedding fails, nothing is touched
    let err = memory.recall(&Content::text("???"), 1, &QueryFilters::default()).await.unwrap_err();
    assert!(matches!(err, Error::EmbeddingUnavailable { .. }));

    assert!(memory.evict(door).await.unwrap());
    assert!(!memory.evict(door).await.unwrap());

    let report = memory.sweep(Duration::from_secs(60)).await.unwrap();
    assert_eq!(report.live_after, 1);

    let stats = memory.stats().unwrap();
    assert_eq!(stats.live, 1);
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.edges, 0);
}

#[test]
fn consolidated_nodes_stay_readable_but_not_mergeable_twice() {
    let (store, clock) = store_with_clock(Config::default());
    let engine = ConsolidationEngine::new(store.clone());
    let a = create(&store, &clock, "A", [1.0, 0.0]);
    let b = create(&store, &clock, "B", [0.999, 0.001]);
    let c = create(&store, &clock, "C", [0.998, 0.002]);
    let graph = store.graph();
    graph.link(a, b, EdgeKind::SemanticSimilarity, 0.9).unwrap();
    graph.link(b, c, EdgeKind::SemanticSimilarity, 0.8).unwrap();

    // b takes part in the a–b merge, so b–c waits for the next sweep
    let first = engine.sweep(Duration::ZERO).unwrap();
    assert_eq!(first.merges.len(), 1);
    assert_eq!(store.get(b).unwrap().merged_into, Some(a));

    // b–c was redirected to a–c and merges now
    let second = engine.sweep(Duration::ZERO).unwrap();
    assert_eq!(second.merges.len(), 1);
    assert_eq!(second.merges[0].merged, c);
    assert_eq!(engine.resolve(c).unwrap(), a);
    assert_eq!(engine.merges().len(), 2);
}
