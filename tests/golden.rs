//! Golden tests for the Trust Kernel.
//!
//! End-to-end turns through `TrustEngine` with known answers.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use trust_kernel::evaluator::{non, not};
use trust_kernel::{
    AuthorityCache, EngineConfig, EntryKind, FeedFetcher, FeedSource, FetchError, OperatorKind,
    ProviderClient, ProviderError, ProviderReply, ProviderRequest, Provenance, RecordingObserver,
    TrustEngine, TrustEntry, TruthTable, TurnRequest, VoteRole,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.fetch.fetch_timeout_ms = 500;
    config.voting.provider_timeout_ms = 500;
    config.turn_deadline_ms = 2_000;
    config
}

fn table(entries: Vec<TrustEntry>) -> TruthTable {
    TruthTable::from_entries(entries).expect("unique ids")
}

fn write_feed(dir: &Path, name: &str, lines: &[&str]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, lines.join("\n")).unwrap();
    url::Url::from_file_path(&path).unwrap().to_string()
}

/// Serves fixed bodies for https URLs and counts fetches.
#[derive(Default)]
struct FixedFeeds {
    bodies: Vec<(String, String)>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl FixedFeeds {
    fn with(mut self, url: &str, body: &str) -> Self {
        self.bodies.push((url.to_string(), body.to_string()));
        self
    }
}

#[async_trait]
impl FeedFetcher for FixedFeeds {
    async fn fetch(&self, source: &FeedSource, _max_bytes: usize) -> Result<Vec<u8>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let FeedSource::Remote(url) = source else {
            return Err(FetchError::Unsupported("local".into()));
        };
        self.bodies
            .iter()
            .find(|(u, _)| u == url.as_str())
            .map(|(_, body)| body.as_bytes().to_vec())
            .ok_or_else(|| FetchError::Network("not found".into()))
    }
}

/// Records the preliminary answer each provider was shown.
#[derive(Default)]
struct EchoProviders {
    seen: Mutex<Vec<(String, VoteRole, Option<String>)>>,
}

impl EchoProviders {
    fn preliminary_for(&self, id: &str) -> Option<Option<String>> {
        self.seen
            .lock()
            .iter()
            .find(|(p, role, _)| p == id && *role == VoteRole::Beta)
            .map(|(_, _, pre)| pre.clone())
    }
}

#[async_trait]
impl ProviderClient for EchoProviders {
    async fn invoke(
        &self,
        provider: &TrustEntry,
        request: ProviderRequest,
    ) -> Result<ProviderReply, ProviderError> {
        self.seen
            .lock()
            .push((provider.id.to_string(), request.round, request.preliminary.clone()));
        Ok(ProviderReply::new(format!("R_{}_{}", provider.id, request.round)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operator algebra
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_non_fixed_points() {
    assert_eq!(non(0.0), 1.0);
    assert_eq!(non(1.0), -1.0);
    assert_eq!(non(-1.0), -1.0);
    for a in [-0.75, -0.3, 0.1, 0.5, 0.99] {
        assert_eq!(non(a), non(-a));
    }
    assert_eq!(not(0.4), -0.4);
}

#[tokio::test]
async fn test_and_of_two_certain_facts() {
    let engine = TrustEngine::builder(test_config()).build();
    let t = table(vec![
        TrustEntry::fact("f1", 1.0),
        TrustEntry::fact("f2", 1.0),
        TrustEntry::operator("d1", OperatorKind::And, ["f1", "f2"]),
    ]);

    let outcome = engine.run(TurnRequest::new(t, "is d1 true?")).await.unwrap();

    assert_eq!(outcome.table.get("d1").unwrap().certainty, 1.0);
    assert_eq!(outcome.bundle.get("d1").unwrap().certainty, 1.0);
}

#[tokio::test]
async fn test_cyclic_operators_terminate() {
    let observer = RecordingObserver::shared();
    let engine = TrustEngine::builder(test_config()).observer(observer.clone()).build();
    let t = table(vec![
        TrustEntry::fact("f1", 0.6),
        TrustEntry::operator("a", OperatorKind::Or, ["f1", "b"]),
        TrustEntry::operator("b", OperatorKind::Not, ["a"]),
    ]);

    let outcome = engine.run(TurnRequest::new(t, "q")).await.unwrap();

    assert!(outcome.evaluation.converged);
    assert!(outcome.evaluation.rounds <= 100);
    assert_eq!(outcome.table.get("a").unwrap().certainty, 0.6);
    assert_eq!(outcome.table.get("b").unwrap().certainty, -0.6);
    assert_eq!(observer.count("trust_kernel_non_convergence_total"), 0);
}

#[tokio::test]
async fn test_mixed_cycle_against_id_order_converges() {
    let observer = RecordingObserver::shared();
    let engine = TrustEngine::builder(test_config()).observer(observer.clone()).build();
    // m_not reads k_non, k_non reads c_or, c_or reads m_not: every edge in
    // the cycle points at an id that sorts before it, fed by a trailing fact.
    let t = table(vec![
        TrustEntry::operator("c_or", OperatorKind::Or, ["z_fact", "m_not"]),
        TrustEntry::operator("k_non", OperatorKind::Non, ["c_or"]),
        TrustEntry::operator("m_not", OperatorKind::Not, ["k_non"]),
        TrustEntry::fact("z_fact", 0.6),
    ]);

    let outcome = engine.run(TurnRequest::new(t, "q")).await.unwrap();

    assert!(outcome.evaluation.converged);
    assert!(outcome.evaluation.rounds <= 100);
    let certainty = |id: &str| outcome.table.get(id).unwrap().certainty;
    assert!((certainty("c_or") - 0.6).abs() < 1e-12);
    assert!((certainty("k_non") + 0.2).abs() < 1e-12);
    assert!((certainty("m_not") - 0.2).abs() < 1e-12);
    assert_eq!(observer.count("trust_kernel_non_convergence_total"), 0);
}

#[tokio::test]
async fn test_long_descending_chain_converges() {
    let observer = RecordingObserver::shared();
    let engine = TrustEngine::builder(test_config()).observer(observer.clone()).build();
    let mut entries = vec![TrustEntry::fact("zz_f", 0.8)];
    let mut prev = "zz_f".to_string();
    for i in (1..=150).rev() {
        let id = format!("n{i:03}");
        entries.push(TrustEntry::operator(id.clone(), OperatorKind::Not, [prev.clone()]));
        prev = id;
    }

    let outcome = engine.run(TurnRequest::new(table(entries), "q")).await.unwrap();

    assert!(outcome.evaluation.converged);
    assert_eq!(outcome.table.get("n001").unwrap().certainty, 0.8);
    assert_eq!(observer.count("trust_kernel_non_convergence_total"), 0);
}

#[tokio::test]
async fn test_invalid_operator_isolated() {
    let observer = RecordingObserver::shared();
    let engine = TrustEngine::builder(test_config()).observer(observer.clone()).build();
    let t = table(vec![
        TrustEntry::fact("f1", 0.8),
        TrustEntry::operator("bad", OperatorKind::And, ["f1"]),
        TrustEntry::operator("dangling", OperatorKind::Not, ["missing"]),
        TrustEntry::operator("good", OperatorKind::Not, ["f1"]),
    ]);

    let outcome = engine.run(TurnRequest::new(t, "q")).await.unwrap();

    assert_eq!(outcome.evaluation.invalid.len(), 2);
    assert_eq!(outcome.table.get("good").unwrap().certainty, -0.8);
    assert_eq!(observer.count("trust_kernel_invalid_operators_total"), 2);
    // Invalid entries are still delivered.
    assert!(outcome.bundle.get("bad").is_some());
}

#[tokio::test]
async fn test_determinism() {
    let build = || {
        table(vec![
            TrustEntry::fact("f1", 0.3),
            TrustEntry::fact("f2", -0.7),
            TrustEntry::operator("o", OperatorKind::Or, ["f1", "f2"]),
            TrustEntry::operator("n", OperatorKind::Non, ["o"]),
        ])
    };
    let engine = TrustEngine::builder(test_config()).build();

    let a = engine.run(TurnRequest::new(build(), "q")).await.unwrap();
    let b = engine.run(TurnRequest::new(build(), "q")).await.unwrap();

    assert_eq!(a.evaluation.derived, b.evaluation.derived);
    assert_eq!(a.bundle.fingerprint, b.bundle.fingerprint);
    assert_ne!(a.request_id, b.request_id);
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorities
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_authority_scales_local_feed() {
    let dir = tempfile::tempdir().unwrap();
    let url = write_feed(
        dir.path(),
        "remote.jsonl",
        &[
            r#"{"kind":"header","version":1}"#,
            r#"{"type":"fact","id":"r1","certainty":1.0,"title":"remote"}"#,
        ],
    );
    let mut config = test_config();
    config.fetch.allowed_file_root = Some(dir.path().to_path_buf());
    let engine = TrustEngine::builder(config).build();

    let t = table(vec![TrustEntry::authority("a1", 0.5, url)]);
    let outcome = engine.run(TurnRequest::new(t, "q")).await.unwrap();

    let imported = outcome.imported();
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].id.as_str(), "a1:r1");
    assert_eq!(imported[0].certainty, 0.5);
    assert!(matches!(imported[0].provenance, Some(Provenance::Authority { .. })));
}

#[tokio::test]
async fn test_authority_point_nine_through_half() {
    let url = "https://trust.example/t.jsonl";
    let feeds = Arc::new(FixedFeeds::default().with(url, r#"{"type":"fact","id":"x","certainty":0.9}"#));
    let engine = TrustEngine::builder(test_config()).fetcher(feeds).build();

    let t = table(vec![TrustEntry::authority("a1", 0.5, url)]);
    let outcome = engine.run(TurnRequest::new(t, "q")).await.unwrap();

    let entry = outcome.bundle.get("a1:x").unwrap();
    assert!((entry.certainty - 0.45).abs() < 1e-12);
}

#[tokio::test]
async fn test_one_hop_only() {
    let url = "https://trust.example/t.jsonl";
    let body = [
        r#"{"type":"fact","id":"x","certainty":1.0}"#,
        r#"{"type":"authority","id":"deeper","certainty":1.0,"url":"https://deeper.example/t.jsonl"}"#,
    ]
    .join("\n");
    let feeds = Arc::new(FixedFeeds::default().with(url, &body));
    let engine = TrustEngine::builder(test_config()).fetcher(feeds.clone()).build();

    let t = table(vec![TrustEntry::authority("a1", 1.0, url)]);
    let outcome = engine.run(TurnRequest::new(t, "q")).await.unwrap();

    let ids: Vec<&str> = outcome.imported().iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["a1:x"]);
    assert_eq!(feeds.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_file_outside_root_is_rejected() {
    let allowed = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let url = write_feed(elsewhere.path(), "t.jsonl", &[r#"{"type":"fact","id":"x","certainty":1.0}"#]);
    let mut config = test_config();
    config.fetch.allowed_file_root = Some(allowed.path().to_path_buf());
    let observer = RecordingObserver::shared();
    let engine = TrustEngine::builder(config).observer(observer.clone()).build();

    let t = table(vec![TrustEntry::authority("a1", 1.0, url)]);
    let outcome = engine.run(TurnRequest::new(t, "q")).await.unwrap();

    assert!(outcome.imported().is_empty());
    assert_eq!(observer.count("trust_kernel_authority_degraded_total"), 1);
}

#[tokio::test]
async fn test_cache_shared_across_turns() {
    let url = "https://trust.example/t.jsonl";
    let feeds = Arc::new(FixedFeeds::default().with(url, r#"{"type":"fact","id":"x","certainty":1.0}"#));
    let cache = Arc::new(AuthorityCache::new(8));
    let engine = TrustEngine::builder(test_config())
        .fetcher(feeds.clone())
        .cache(cache.clone())
        .build();

    for _ in 0..3 {
        let t = table(vec![TrustEntry::authority("a1", 1.0, url)]);
        let outcome = engine.run(TurnRequest::new(t, "q")).await.unwrap();
        assert_eq!(outcome.imported().len(), 1);
    }

    assert_eq!(feeds.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(engine.cache_stats().fetches, 1);
}

#[tokio::test]
async fn test_concurrent_turns_coalesce_fetch() {
    let url = "https://trust.example/t.jsonl";
    let feeds = Arc::new(FixedFeeds {
        delay: Some(Duration::from_millis(50)),
        ..FixedFeeds::default()
    }
    .with(url, r#"{"type":"fact","id":"x","certainty":1.0}"#));
    let engine = Arc::new(TrustEngine::builder(test_config()).fetcher(feeds.clone()).build());

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let t = table(vec![TrustEntry::authority(format!("a{i}"), 1.0, url)]);
            engine.run(TurnRequest::new(t, "q")).await.unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().imported().len(), 1);
    }

    assert_eq!(feeds.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_turn_deadline_abandons_slow_authority() {
    let url = "https://slow.example/t.jsonl";
    let feeds = Arc::new(FixedFeeds {
        delay: Some(Duration::from_secs(60)),
        ..FixedFeeds::default()
    }
    .with(url, r#"{"type":"fact","id":"x","certainty":1.0}"#));
    let mut config = test_config();
    config.fetch.fetch_timeout_ms = 120_000;
    let observer = RecordingObserver::shared();
    let engine = TrustEngine::builder(config)
        .fetcher(feeds)
        .observer(observer.clone())
        .build();

    let t = table(vec![TrustEntry::fact("f1", 1.0), TrustEntry::authority("a1", 1.0, url)]);
    let request = TurnRequest::new(t, "q").with_deadline(Duration::from_millis(100));
    let outcome = engine.run(request).await.unwrap();

    assert!(outcome.imported().is_empty());
    assert_eq!(outcome.bundle.len(), 2);
    assert_eq!(observer.count("trust_kernel_deadline_expired_total"), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Voting
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_prelim_flag_controls_beta_context() {
    let providers = Arc::new(EchoProviders::default());
    let engine = TrustEngine::builder(test_config()).providers(providers.clone()).build();
    let t = table(vec![
        TrustEntry::provider("P1", 0.9, "agent://p1"),
        TrustEntry::provider("P2", 0.5, "agent://p2").with_prelim(false),
        TrustEntry::provider("P3", 0.3, "agent://p3").with_prelim(true),
    ]);

    let outcome = engine.run(TurnRequest::new(t, "q")).await.unwrap();

    assert_eq!(outcome.vote.alpha.as_ref().map(|id| id.as_str()), Some("P1"));
    assert_eq!(providers.preliminary_for("P2"), Some(None));
    assert_eq!(
        providers.preliminary_for("P3"),
        Some(Some("R_P1_alpha_prelim".to_string()))
    );
}

#[tokio::test]
async fn test_provider_entries_inherit_certainty() {
    let providers = Arc::new(EchoProviders::default());
    let engine = TrustEngine::builder(test_config()).providers(providers).build();
    let t = table(vec![
        TrustEntry::provider("P1", 0.9, "agent://p1"),
        TrustEntry::provider("P2", -0.4, "agent://p2"),
    ]);

    let outcome = engine.run(TurnRequest::new(t, "q")).await.unwrap();

    let beta = outcome.bundle.get("P2:beta").unwrap();
    assert_eq!(beta.certainty, -0.4);
    assert!(matches!(beta.kind, EntryKind::Reference { .. }));
    let last = outcome.bundle.entries.last().unwrap();
    assert_eq!(last.entry.id.as_str(), "P1:alpha_final");
    assert_eq!(last.entry.content, "R_P1_alpha_final");
}

#[tokio::test]
async fn test_fingerprint_stable_with_providers() {
    let build = || {
        table(vec![
            TrustEntry::fact("f1", 0.4),
            TrustEntry::provider("P1", 0.9, "agent://p1"),
            TrustEntry::provider("P2", 0.5, "agent://p2"),
        ])
    };
    let engine = TrustEngine::builder(test_config())
        .providers(Arc::new(EchoProviders::default()))
        .build();

    let a = engine.run(TurnRequest::new(build(), "q")).await.unwrap();
    let b = engine.run(TurnRequest::new(build(), "q")).await.unwrap();

    assert_eq!(a.provider_entries().len(), 3);
    assert_eq!(a.bundle.fingerprint, b.bundle.fingerprint);
}
