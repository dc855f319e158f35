//! Library-level tests for the replication pipeline, the auditor, and both
//! rebuild directions, run against the in-memory store and a temp mirror.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use afs_mirror::audit::{audit, Recommendation};
use afs_mirror::config::Config;
use afs_mirror::lock::{CollectionLock, LockSettings};
use afs_mirror::mirror::MirrorStore;
use afs_mirror::models::{EntityKind, Operation, OwnerRecord, UpsertOutcome};
use afs_mirror::progress::NoProgress;
use afs_mirror::queue::{FlushSummary, SyncQueue};
use afs_mirror::rebuild::forward::forward_rebuild;
use afs_mirror::rebuild::reverse::reverse_rebuild;
use afs_mirror::replication::Replication;
use afs_mirror::store::memory::InMemoryStore;
use afs_mirror::store::{self, MutationHook, RecordStore};
use afs_mirror::sync::MirrorSync;

// ============ Fixtures ============

fn owner_doc(id: &str) -> Value {
    json!({
        "id": id,
        "name": format!("Owner {}", id),
        "createdAt": "2024-01-01T00:00:00Z",
        "updatedAt": "2024-01-02T00:00:00Z",
        "profile": {"hometown": "Chengdu"},
        "companion": {
            "roleCard": {"personality": "warm"},
            "assistantsGuidelines": [{"assistantId": "h1"}]
        }
    })
}

fn answer_doc(id: &str, owner: &str, order: u32) -> Value {
    json!({
        "id": id,
        "userId": owner,
        "targetUserId": owner,
        "questionId": format!("q{}", order),
        "questionText": "What did you do as a child?",
        "questionOrder": order,
        "questionLayer": "basic",
        "relationshipType": "self",
        "answer": "I grew up near the river and fished every summer.",
        "createdAt": "2024-03-01T00:00:00Z",
        "updatedAt": "2024-03-01T00:00:00Z"
    })
}

fn relation_doc(id: &str, target: &str) -> Value {
    json!({
        "relationId": id,
        "assistantId": "h1",
        "targetId": target,
        "relationshipType": "family",
        "createdAt": "2024-02-01T00:00:00Z",
        "specificRelation": "daughter"
    })
}

fn session_doc(id: &str, target: &str) -> Value {
    json!({
        "sessionId": id,
        "targetUserId": target,
        "interlocutorUserId": "visitor",
        "relation": "stranger",
        "messages": [{"role": "user", "content": "hello"}],
        "startedAt": "2024-04-01T00:00:00Z"
    })
}

fn fast_locks() -> LockSettings {
    LockSettings {
        stale_after: Duration::from_secs(5),
        retries: 0,
        retry_delay: Duration::from_millis(1),
    }
}

fn mirror_sync(store: Arc<dyn RecordStore>, tmp: &TempDir) -> MirrorSync {
    MirrorSync::new(
        store,
        MirrorStore::new(tmp.path().join("mirror")),
        tmp.path().join("locks"),
        fast_locks(),
    )
}

async fn seed(store: &InMemoryStore) {
    store.upsert(EntityKind::Owner, "u1", &owner_doc("u1")).await.unwrap();
    store.upsert(EntityKind::Owner, "u2", &owner_doc("u2")).await.unwrap();
    store
        .upsert(EntityKind::Answer, "a1", &answer_doc("a1", "u1", 1))
        .await
        .unwrap();
    store
        .upsert(EntityKind::Answer, "a2", &answer_doc("a2", "u1", 2))
        .await
        .unwrap();
    store
        .upsert(EntityKind::AssistRelation, "r1", &relation_doc("r1", "u1"))
        .await
        .unwrap();
    store
        .upsert(EntityKind::ChatSession, "s1", &session_doc("s1", "u1"))
        .await
        .unwrap();
}

fn put(root: &Path, relative: &str, body: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

/// Delegates to an in-memory store and counts SoR re-fetches.
struct CountingStore {
    inner: InMemoryStore,
    fetches: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for CountingStore {
    async fn fetch(&self, kind: EntityKind, id: &str) -> Result<Option<Value>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(kind, id).await
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>> {
        self.inner.list(kind).await
    }

    async fn list_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        self.inner.list_ids(kind).await
    }

    async fn upsert(&self, kind: EntityKind, id: &str, document: &Value) -> Result<UpsertOutcome> {
        self.inner.upsert(kind, id, document).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        self.inner.delete(kind, id).await
    }

    async fn attach_hook(&self, kind: EntityKind, hook: Arc<dyn MutationHook>) -> Result<()> {
        self.inner.attach_hook(kind, hook).await
    }
}

// ============ Queue + sync ============

#[tokio::test(start_paused = true)]
async fn burst_of_saves_refetches_once() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(CountingStore::new());
    store
        .upsert(EntityKind::Answer, "a1", &answer_doc("a1", "u1", 1))
        .await
        .unwrap();

    let sync = Arc::new(mirror_sync(store.clone(), &tmp));
    let queue = SyncQueue::new(sync, Duration::from_millis(100)).unwrap();

    for _ in 0..3 {
        queue.enqueue(EntityKind::Answer, "a1", Operation::Save, None);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.fetches(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.fetches(), 1);
    assert!(tmp.path().join("mirror/answers/a1/answer.json").is_file());
    assert!(tmp
        .path()
        .join("mirror/u1/A_set/self/basic/question_1.json")
        .is_file());
}

#[tokio::test]
async fn held_lock_fails_only_that_kind() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    seed(&store).await;

    let sync = Arc::new(mirror_sync(store.clone(), &tmp));
    let queue = SyncQueue::new(sync, Duration::from_secs(60)).unwrap();

    let _held = CollectionLock::for_kind(&tmp.path().join("locks"), EntityKind::Answer, &fast_locks())
        .await
        .unwrap();

    queue.enqueue(EntityKind::Answer, "a1", Operation::Save, None);
    queue.enqueue(EntityKind::Owner, "u1", Operation::Save, None);

    let summary = queue.flush().await;
    assert_eq!(
        summary,
        FlushSummary {
            attempted: 2,
            succeeded: 1,
            failed: 1
        }
    );
    assert!(tmp.path().join("mirror/u1/profile.json").is_file());
    assert!(!tmp.path().join("mirror/answers/a1").exists());
    assert_eq!(queue.pending_len(), 0);
}

// ============ Replication wiring ============

fn replication_config(tmp: &TempDir, debounce_ms: u64) -> Config {
    let mut config = Config::default();
    config.mirror.root = tmp.path().join("userdata");
    config.sync.debounce_ms = debounce_ms;
    config.sync.lock_retries = 0;
    config
}

#[tokio::test]
async fn store_mutations_reach_the_mirror_on_shutdown() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let replication = Replication::start(store.clone(), &replication_config(&tmp, 60_000))
        .await
        .unwrap();
    assert_eq!(replication.registration().attached.len(), 4);
    assert!(replication.registration().failed.is_empty());

    store
        .upsert(EntityKind::ChatSession, "s1", &session_doc("s1", "u1"))
        .await
        .unwrap();
    store
        .upsert(EntityKind::AssistRelation, "r1", &relation_doc("r1", "u1"))
        .await
        .unwrap();
    assert_eq!(replication.queue().pending_len(), 2);

    let summary = replication.shutdown().await;
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.failed, 0);

    let root = tmp.path().join("userdata");
    assert!(root.join("chatSessions/s1/session.json").is_file());
    let relations: Value =
        serde_json::from_str(&fs::read_to_string(root.join("u1/assist-relations.json")).unwrap())
            .unwrap();
    assert_eq!(relations[0]["relationId"], "r1");
    assert_eq!(relations[0]["specificRelation"], "daughter");
    assert!(tmp.path().join(".locks").is_dir());
}

#[tokio::test(start_paused = true)]
async fn debounce_flushes_without_shutdown() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let replication = Replication::start(store.clone(), &replication_config(&tmp, 100))
        .await
        .unwrap();

    store.upsert(EntityKind::Owner, "u1", &owner_doc("u1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!tmp.path().join("userdata/u1/profile.json").exists());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tmp.path().join("userdata/u1/profile.json").is_file());
    assert!(tmp.path().join("userdata/u1/rolecard.json").is_file());
    assert!(!replication.queue().timer_armed());
}

#[tokio::test]
async fn deletes_leave_the_mirror_alone() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let replication = Replication::start(store.clone(), &replication_config(&tmp, 60_000))
        .await
        .unwrap();

    store
        .upsert(EntityKind::ChatSession, "s1", &session_doc("s1", "u1"))
        .await
        .unwrap();
    replication.queue().flush().await;

    store.delete(EntityKind::ChatSession, "s1").await.unwrap();
    let buffered = replication
        .queue()
        .buffered(EntityKind::ChatSession, "s1")
        .unwrap();
    assert_eq!(buffered.operation, Operation::Delete);
    assert!(buffered.payload.is_none());

    replication.shutdown().await;
    assert!(tmp
        .path()
        .join("userdata/chatSessions/s1/session.json")
        .is_file());
}

#[tokio::test]
async fn missing_collection_does_not_stop_registration() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::without_collections([EntityKind::AssistRelation]));
    let replication = Replication::start(store.clone(), &replication_config(&tmp, 60_000))
        .await
        .unwrap();

    let registration = replication.registration();
    assert_eq!(registration.attached.len(), 3);
    assert_eq!(registration.failed.len(), 1);
    assert_eq!(registration.failed[0].0, EntityKind::AssistRelation);

    store.upsert(EntityKind::Owner, "u1", &owner_doc("u1")).await.unwrap();
    let summary = replication.shutdown().await;
    assert_eq!(summary.succeeded, 1);
}

// ============ Audit ============

#[tokio::test]
async fn audit_reports_drift_and_recommends_forward() {
    let tmp = TempDir::new().unwrap();
    let store = InMemoryStore::new();
    for i in 0..10 {
        let id = format!("a{}", i);
        store
            .upsert(EntityKind::Answer, &id, &answer_doc(&id, "u1", i))
            .await
            .unwrap();
    }
    let root = tmp.path().join("mirror");
    for i in 0..8 {
        put(&root, &format!("answers/a{}/answer.json", i), "{}");
    }
    put(&root, "answers/x1/answer.json", "{}");
    put(&root, "answers/x2/answer.json", "{}");
    // A directory without its snapshot file does not count.
    fs::create_dir_all(root.join("answers/x3")).unwrap();

    let report = audit(&store, &MirrorStore::new(&root)).await.unwrap();
    let answers = report.kind(EntityKind::Answer).unwrap();
    assert_eq!(answers.consistency_percent, 67);
    assert_eq!(answers.only_in_sor, vec!["a8", "a9"]);
    assert_eq!(answers.only_in_mirror, vec!["x1", "x2"]);
    assert_eq!(report.recommendation, Recommendation::ForwardRebuild);
    assert_eq!(
        report.kind(EntityKind::Owner).unwrap().consistency_percent,
        100
    );
}

#[tokio::test]
async fn audit_after_forward_rebuild_is_consistent() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    seed(&store).await;
    let sync = mirror_sync(store.clone(), &tmp);

    forward_rebuild(store.as_ref(), &sync, &NoProgress).await.unwrap();

    let report = audit(store.as_ref(), sync.mirror()).await.unwrap();
    assert!(report.is_consistent(), "{:?}", report.summary);
    assert_eq!(report.summary.total_inconsistencies, 0);
}

// ============ Forward rebuild ============

#[tokio::test]
async fn forward_rebuild_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    seed(&store).await;
    let sync = mirror_sync(store.clone(), &tmp);

    let first = forward_rebuild(store.as_ref(), &sync, &NoProgress).await.unwrap();
    let second = forward_rebuild(store.as_ref(), &sync, &NoProgress).await.unwrap();

    assert_eq!(first.totals().errors, 0);
    assert_eq!(first.stats(EntityKind::Owner).processed, 2);
    assert_eq!(first.stats(EntityKind::Answer).processed, 2);
    assert!(first.digest.is_some());
    assert_eq!(first.digest, second.digest);

    let guidelines: Value = serde_json::from_str(
        &fs::read_to_string(tmp.path().join("mirror/u1/assistants-guidelines.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(guidelines["ownerId"], "u1");
    assert_eq!(guidelines["version"], "1.0.0");
}

#[tokio::test]
async fn forward_rebuild_without_owner_timestamps_is_byte_stable() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    store
        .upsert(EntityKind::Owner, "u1", &json!({"id": "u1", "name": "x"}))
        .await
        .unwrap();
    let sync = mirror_sync(store.clone(), &tmp);
    let profile = tmp.path().join("mirror/u1/profile.json");

    let first = forward_rebuild(store.as_ref(), &sync, &NoProgress).await.unwrap();
    let bytes = fs::read(&profile).unwrap();
    let second = forward_rebuild(store.as_ref(), &sync, &NoProgress).await.unwrap();

    assert_eq!(first.totals().errors, 0);
    assert_eq!(first.digest, second.digest);
    assert_eq!(fs::read(&profile).unwrap(), bytes);

    let written: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(written.get("createdAt").is_none());
    assert!(written.get("updatedAt").is_none());
}

#[tokio::test]
async fn forward_rebuild_counts_bad_documents_and_continues() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    seed(&store).await;
    store
        .upsert(EntityKind::Answer, "broken", &json!({"id": "broken"}))
        .await
        .unwrap();
    let sync = mirror_sync(store.clone(), &tmp);

    let summary = forward_rebuild(store.as_ref(), &sync, &NoProgress).await.unwrap();
    let answers = summary.stats(EntityKind::Answer);
    assert_eq!(answers.total, 3);
    assert_eq!(answers.processed, 2);
    assert_eq!(answers.errors, 1);
    assert!(tmp.path().join("mirror/answers/a1/answer.json").is_file());
}

// ============ Reverse rebuild ============

#[tokio::test]
async fn reverse_rebuild_restores_profile_only_owners_with_warnings() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("mirror");
    for id in ["u1", "u2", "u3"] {
        put(
            &root,
            &format!("{}/profile.json", id),
            &json!({"id": "ignored", "name": id, "createdAt": "2024-01-01T00:00:00Z"}).to_string(),
        );
    }
    let store = InMemoryStore::new();

    let summary = reverse_rebuild(&store, &MirrorStore::new(&root), &NoProgress)
        .await
        .unwrap();
    let owners = summary.stats(EntityKind::Owner);
    assert_eq!(owners.total, 3);
    assert_eq!(owners.created, 3);
    assert_eq!(owners.warnings, 3);
    assert_eq!(owners.errors, 0);

    // The id comes from the directory name, not the file body.
    let restored: OwnerRecord = store::get(&store, "u2").await.unwrap().unwrap();
    assert_eq!(restored.id().as_str(), "u2");
    assert_eq!(restored.profile.name.as_deref(), Some("u2"));
    assert!(restored.companion.role_card.is_none());
}

#[tokio::test]
async fn reverse_rebuild_round_trips_a_forward_mirror() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(InMemoryStore::new());
    seed(&source).await;
    let sync = mirror_sync(source.clone(), &tmp);
    forward_rebuild(source.as_ref(), &sync, &NoProgress).await.unwrap();

    let restored = InMemoryStore::new();
    let summary = reverse_rebuild(&restored, sync.mirror(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(summary.totals().errors, 0);

    for kind in EntityKind::ALL {
        assert_eq!(
            restored.list_ids(kind).await.unwrap(),
            source.list_ids(kind).await.unwrap(),
            "{} ids differ",
            kind
        );
    }
    let owner: OwnerRecord = store::get(&restored, "u1").await.unwrap().unwrap();
    assert_eq!(owner.companion.role_card, Some(json!({"personality": "warm"})));
    assert_eq!(
        owner.companion.assistants_guidelines,
        Some(json!([{"assistantId": "h1"}]))
    );

    // Restoring again into the same store changes nothing.
    let again = reverse_rebuild(&restored, sync.mirror(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(again.totals().unchanged, again.totals().processed);
}

#[tokio::test]
async fn retargeted_relation_restores_the_new_target() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    store
        .upsert(EntityKind::AssistRelation, "r1", &relation_doc("r1", "zed"))
        .await
        .unwrap();
    let sync = mirror_sync(store.clone(), &tmp);
    sync.sync_one(EntityKind::AssistRelation, "r1").await.unwrap();

    store
        .upsert(EntityKind::AssistRelation, "r1", &relation_doc("r1", "amy"))
        .await
        .unwrap();
    sync.sync_one(EntityKind::AssistRelation, "r1").await.unwrap();

    let stale: Value = serde_json::from_str(
        &fs::read_to_string(tmp.path().join("mirror/zed/assist-relations.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(stale, json!([]));

    let restored = InMemoryStore::new();
    let summary = reverse_rebuild(&restored, sync.mirror(), &NoProgress)
        .await
        .unwrap();
    let relations = summary.stats(EntityKind::AssistRelation);
    assert_eq!(relations.created, 1);
    assert_eq!(relations.warnings, 0);
    let doc = restored
        .fetch(EntityKind::AssistRelation, "r1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["targetId"], "amy");
}

#[tokio::test]
async fn reverse_rebuild_keeps_first_copy_of_duplicate_relation() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("mirror");
    put(
        &root,
        "amy/assist-relations.json",
        &json!([relation_doc("r1", "amy")]).to_string(),
    );
    put(
        &root,
        "zed/assist-relations.json",
        &json!([relation_doc("r1", "zed")]).to_string(),
    );

    let store = InMemoryStore::new();
    let summary = reverse_rebuild(&store, &MirrorStore::new(&root), &NoProgress)
        .await
        .unwrap();
    let relations = summary.stats(EntityKind::AssistRelation);
    assert_eq!(relations.total, 2);
    assert_eq!(relations.created, 1);
    assert_eq!(relations.skipped, 1);
    assert_eq!(relations.warnings, 1);
    let doc = store
        .fetch(EntityKind::AssistRelation, "r1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["targetId"], "amy");
}

#[tokio::test]
async fn reverse_rebuild_counts_item_failures() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("mirror");
    put(&root, "answers/a1/answer.json", "{ not json");
    fs::create_dir_all(root.join("answers/a2")).unwrap();
    put(
        &root,
        "chatSessions/s1/session.json",
        &session_doc("other", "u1").to_string(),
    );
    put(&root, "u1/assist-relations.json", r#"{"not": "an array"}"#);
    put(&root, "u2/notes.txt", "no owner files here");

    let store = InMemoryStore::new();
    let summary = reverse_rebuild(&store, &MirrorStore::new(&root), &NoProgress)
        .await
        .unwrap();

    assert_eq!(summary.stats(EntityKind::Answer).errors, 2);
    assert_eq!(summary.stats(EntityKind::ChatSession).created, 1);
    assert_eq!(summary.stats(EntityKind::AssistRelation).errors, 1);
    let owners = summary.stats(EntityKind::Owner);
    assert_eq!(owners.skipped, 2);
    assert_eq!(owners.warnings, 2);
    assert_eq!(store.list_ids(EntityKind::ChatSession).await.unwrap(), vec!["s1"]);
}

#[tokio::test]
async fn reverse_rebuild_requires_a_mirror_root() {
    let tmp = TempDir::new().unwrap();
    let store = InMemoryStore::new();
    let err = reverse_rebuild(
        &store,
        &MirrorStore::new(tmp.path().join("missing")),
        &NoProgress,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("not a directory"));
}
