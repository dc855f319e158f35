//! Filesystem mirror of the system of record.
//!
//! The mirror is derived state: every file here can be reproduced from the
//! SoR. Writers serialize records as pretty JSON and replace files atomically
//! (temp file + rename); a file whose bytes would not change is left alone.
//! Readers back the auditor and the reverse rebuild.
//!
//! ```text
//! <root>/
//!   <ownerId>/
//!     profile.json  rolecard.json  strangerSentiments.json
//!     conversationsAsTarget.json  assistants-guidelines.json  assist-relations.json
//!     A_set/self/<layer>/question_<n>.json
//!     B_sets/<contributor>/<layer>/question_<n>.json
//!     C_sets/<contributor>/<layer>/question_<n>.json
//!   answers/<answerId>/answer.json
//!   chatSessions/<sessionId>/session.json
//! ```

pub mod memory;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{MirrorError, MirrorResult};
use crate::models::{
    AnswerId, AssistRelationRecord, ChatSessionRecord, OwnerId, OwnerRecord, SessionId,
    RESERVED_DIRS,
};

pub const PROFILE_FILE: &str = "profile.json";
pub const ROLE_CARD_FILE: &str = "rolecard.json";
pub const SENTIMENTS_FILE: &str = "strangerSentiments.json";
pub const CONVERSATIONS_FILE: &str = "conversationsAsTarget.json";
pub const GUIDELINES_FILE: &str = "assistants-guidelines.json";
pub const RELATIONS_FILE: &str = "assist-relations.json";

pub const ANSWERS_DIR: &str = "answers";
pub const SESSIONS_DIR: &str = "chatSessions";
pub const ANSWER_FILE: &str = "answer.json";
pub const SESSION_FILE: &str = "session.json";

pub const GUIDELINES_VERSION: &str = "1.0.0";

/// Files that may appear directly inside an owner directory.
pub const OWNER_FILES: [&str; 6] = [
    PROFILE_FILE,
    ROLE_CARD_FILE,
    SENTIMENTS_FILE,
    CONVERSATIONS_FILE,
    GUIDELINES_FILE,
    RELATIONS_FILE,
];

/// Files written for one record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub written: usize,
    pub unchanged: usize,
}

impl WriteReport {
    fn record(&mut self, changed: bool) {
        if changed {
            self.written += 1;
        } else {
            self.unchanged += 1;
        }
    }
}

/// Per-owner files found during a reverse rebuild.
#[derive(Debug, Default, Clone)]
pub struct OwnerFiles {
    pub profile: Option<Value>,
    pub role_card: Option<Value>,
    pub stranger_sentiments: Option<Value>,
    pub conversations_as_target: Option<Value>,
    pub assistants_guidelines: Option<Value>,
}

impl OwnerFiles {
    pub fn is_empty(&self) -> bool {
        self.missing().len() == 5
    }

    /// Names of the expected files that were not found.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (PROFILE_FILE, self.profile.is_some()),
            (ROLE_CARD_FILE, self.role_card.is_some()),
            (SENTIMENTS_FILE, self.stranger_sentiments.is_some()),
            (CONVERSATIONS_FILE, self.conversations_as_target.is_some()),
            (GUIDELINES_FILE, self.assistants_guidelines.is_some()),
        ]
        .into_iter()
        .filter(|(_, present)| !present)
        .map(|(name, _)| name)
        .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MirrorStore {
    root: PathBuf,
}

impl MirrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> MirrorResult<()> {
        fs::create_dir_all(&self.root).map_err(|e| MirrorError::io(&self.root, e))
    }

    pub fn owner_dir(&self, owner: &OwnerId) -> PathBuf {
        self.root.join(owner.as_str())
    }

    pub fn answer_path(&self, id: &AnswerId) -> PathBuf {
        self.root.join(ANSWERS_DIR).join(id.as_str()).join(ANSWER_FILE)
    }

    pub fn session_path(&self, id: &SessionId) -> PathBuf {
        self.root.join(SESSIONS_DIR).join(id.as_str()).join(SESSION_FILE)
    }

    // ============ Writers ============

    /// Write `profile.json` and each companion sub-document the record holds.
    pub fn write_owner(&self, owner: &OwnerRecord) -> MirrorResult<WriteReport> {
        let dir = self.owner_dir(owner.id());
        let mut report = WriteReport::default();

        report.record(write_json(&dir.join(PROFILE_FILE), &owner.profile)?);

        let companion = &owner.companion;
        if let Some(role_card) = &companion.role_card {
            report.record(write_json(&dir.join(ROLE_CARD_FILE), role_card)?);
        }
        if let Some(sentiments) = &companion.stranger_sentiments {
            report.record(write_json(&dir.join(SENTIMENTS_FILE), sentiments)?);
        }
        if let Some(conversations) = &companion.conversations_as_target {
            report.record(write_json(&dir.join(CONVERSATIONS_FILE), conversations)?);
        }
        if let Some(guidelines) = &companion.assistants_guidelines {
            let file = json!({
                "ownerId": owner.id(),
                "guidelines": guidelines,
                "version": GUIDELINES_VERSION,
            });
            report.record(write_json(&dir.join(GUIDELINES_FILE), &file)?);
        }

        debug!(owner = %owner.id(), written = report.written, "owner mirrored");
        Ok(report)
    }

    /// Merge one relation into its target owner's `assist-relations.json`
    /// and drop any copy left under a previous target.
    pub fn write_relation(&self, relation: &AssistRelationRecord) -> MirrorResult<WriteReport> {
        let path = self.owner_dir(&relation.target_id).join(RELATIONS_FILE);

        let mut entries = match read_json(&path) {
            Ok(Some(Value::Array(entries))) => entries,
            Ok(None) => Vec::new(),
            Ok(Some(_)) | Err(MirrorError::MalformedFile { .. }) => {
                warn!(path = %path.display(), "relations file is not a JSON array, rewriting");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let id = relation.id.as_str();
        entries.retain(|entry| relation_key(entry) != id);
        entries.push(serde_json::to_value(relation)?);
        entries.sort_by(|a, b| relation_key(a).cmp(relation_key(b)));

        let mut report = WriteReport::default();
        report.record(write_json(&path, &entries)?);

        for other in self.relation_files()? {
            if other != path && self.remove_relation(&other, id)? {
                debug!(relation = id, path = %other.display(), "removed relation left by a previous target");
                report.written += 1;
            }
        }
        Ok(report)
    }

    /// Remove `id` from one relations file. Unreadable files are left alone.
    fn remove_relation(&self, path: &Path, id: &str) -> MirrorResult<bool> {
        let mut entries = match read_json(path) {
            Ok(Some(Value::Array(entries))) => entries,
            Ok(_) | Err(MirrorError::MalformedFile { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let before = entries.len();
        entries.retain(|entry| relation_key(entry) != id);
        if entries.len() == before {
            return Ok(false);
        }
        write_json(path, &entries)
    }

    pub fn write_session(&self, session: &ChatSessionRecord) -> MirrorResult<WriteReport> {
        let mut report = WriteReport::default();
        report.record(write_json(&self.session_path(&session.session_id), session)?);
        Ok(report)
    }

    // ============ Readers ============

    /// Owner directory names, sorted. Reserved and hidden names are skipped.
    pub fn owner_dir_names(&self) -> MirrorResult<Vec<String>> {
        Ok(list_dirs(&self.root)?
            .into_iter()
            .filter(|name| !RESERVED_DIRS.contains(&name.as_str()))
            .collect())
    }

    pub fn answer_dir_names(&self) -> MirrorResult<Vec<String>> {
        list_dirs(&self.root.join(ANSWERS_DIR))
    }

    pub fn session_dir_names(&self) -> MirrorResult<Vec<String>> {
        list_dirs(&self.root.join(SESSIONS_DIR))
    }

    /// Every `assist-relations.json` under an owner directory, sorted.
    pub fn relation_files(&self) -> MirrorResult<Vec<PathBuf>> {
        Ok(self
            .owner_dir_names()?
            .into_iter()
            .map(|name| self.root.join(name).join(RELATIONS_FILE))
            .filter(|path| path.is_file())
            .collect())
    }

    /// Entries of one relations file.
    pub fn read_relations(&self, path: &Path) -> MirrorResult<Vec<Value>> {
        match read_json(path)? {
            Some(Value::Array(entries)) => Ok(entries),
            Some(_) => Err(MirrorError::MalformedFile {
                path: path.to_path_buf(),
                source: serde::de::Error::custom("expected a JSON array"),
            }),
            None => Ok(Vec::new()),
        }
    }

    pub fn read_owner(&self, owner: &OwnerId) -> MirrorResult<OwnerFiles> {
        let dir = self.owner_dir(owner);
        let guidelines = read_json(&dir.join(GUIDELINES_FILE))?.map(|file| match file {
            Value::Object(mut map) if map.contains_key("guidelines") => {
                map.remove("guidelines").unwrap_or(Value::Null)
            }
            other => other,
        });

        Ok(OwnerFiles {
            profile: read_json(&dir.join(PROFILE_FILE))?,
            role_card: read_json(&dir.join(ROLE_CARD_FILE))?,
            stranger_sentiments: read_json(&dir.join(SENTIMENTS_FILE))?,
            conversations_as_target: read_json(&dir.join(CONVERSATIONS_FILE))?,
            assistants_guidelines: guidelines,
        })
    }

    /// Raw JSON of a file inside the mirror; `None` when absent.
    pub fn read_file(&self, path: &Path) -> MirrorResult<Option<Value>> {
        read_json(path)
    }

    /// SHA-256 over every file path and its bytes, in sorted order.
    pub fn tree_digest(&self) -> MirrorResult<String> {
        let mut hasher = Sha256::new();
        if self.root.exists() {
            for entry in WalkDir::new(&self.root).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    let path = e.path().unwrap_or(&self.root).to_path_buf();
                    MirrorError::io(path, e.into())
                })?;
                if !entry.file_type().is_file() || is_hidden(entry.file_name()) {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&self.root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                let bytes = fs::read(entry.path()).map_err(|e| MirrorError::io(entry.path(), e))?;
                hasher.update(relative.as_bytes());
                hasher.update([0u8]);
                hasher.update(&bytes);
                hasher.update([0u8]);
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

pub(crate) fn relation_key(entry: &Value) -> &str {
    entry
        .get("relationId")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

pub(crate) fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Sorted names of the visible subdirectories of `dir`. A missing directory
/// lists as empty.
fn list_dirs(dir: &Path) -> MirrorResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "mirror directory absent");
            return Ok(Vec::new());
        }
        Err(e) => return Err(MirrorError::io(dir, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| MirrorError::io(dir, e))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| MirrorError::io(entry.path(), e))?
            .is_dir();
        if is_dir && !is_hidden(&entry.file_name()) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn read_json(path: &Path) -> MirrorResult<Option<Value>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MirrorError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| MirrorError::MalformedFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Atomically replace `path` with pretty JSON. Returns `false` when the file
/// already held exactly these bytes.
pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> MirrorResult<bool> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');

    if fs::read(path).map_or(false, |existing| existing == bytes) {
        return Ok(false);
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    fs::write(&tmp, &bytes).map_err(|e| MirrorError::io(&tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(MirrorError::io(path, e));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompanionData, OwnerProfile};
    use chrono::{TimeZone, Utc};
    use serde_json::Map;
    use tempfile::TempDir;

    fn owner(id: &str) -> OwnerRecord {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        OwnerRecord {
            profile: OwnerProfile {
                id: OwnerId::parse(id).unwrap(),
                email: None,
                unique_code: Some("ABC".into()),
                name: Some("Grandma".into()),
                created_at: Some(ts),
                updated_at: Some(ts),
                last_login: None,
                profile: Map::new(),
            },
            companion: CompanionData::default(),
        }
    }

    fn relation(id: &str, target: &str) -> AssistRelationRecord {
        serde_json::from_value(json!({
            "relationId": id,
            "assistantId": "helper",
            "targetId": target,
            "relationshipType": "family",
            "createdAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn owner_writes_only_present_subdocuments() {
        let tmp = TempDir::new().unwrap();
        let mirror = MirrorStore::new(tmp.path());
        let mut record = owner("u1");
        record.companion.role_card = Some(json!({"personality": "warm"}));
        record.companion.assistants_guidelines = Some(json!([{"assistantId": "h"}]));

        let report = mirror.write_owner(&record).unwrap();
        assert_eq!(report.written, 3);

        let dir = tmp.path().join("u1");
        assert!(dir.join(PROFILE_FILE).is_file());
        assert!(dir.join(ROLE_CARD_FILE).is_file());
        assert!(!dir.join(SENTIMENTS_FILE).exists());
        let guidelines: Value =
            serde_json::from_str(&fs::read_to_string(dir.join(GUIDELINES_FILE)).unwrap()).unwrap();
        assert_eq!(guidelines["ownerId"], "u1");
        assert_eq!(guidelines["version"], GUIDELINES_VERSION);

        let again = mirror.write_owner(&record).unwrap();
        assert_eq!(again.written, 0);
        assert_eq!(again.unchanged, 3);
    }

    #[test]
    fn relations_merge_by_id_sorted() {
        let tmp = TempDir::new().unwrap();
        let mirror = MirrorStore::new(tmp.path());
        mirror.write_relation(&relation("r2", "elder")).unwrap();
        mirror.write_relation(&relation("r1", "elder")).unwrap();

        let mut updated = relation("r2", "elder");
        updated.is_active = false;
        mirror.write_relation(&updated).unwrap();

        let path = tmp.path().join("elder").join(RELATIONS_FILE);
        let entries = mirror.read_relations(&path).unwrap();
        let ids: Vec<&str> = entries.iter().map(relation_key).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert_eq!(entries[1]["isActive"], false);
    }

    #[test]
    fn retargeted_relation_leaves_one_copy() {
        let tmp = TempDir::new().unwrap();
        let mirror = MirrorStore::new(tmp.path());
        mirror.write_relation(&relation("r1", "zed")).unwrap();
        mirror.write_relation(&relation("r2", "zed")).unwrap();

        let report = mirror.write_relation(&relation("r1", "amy")).unwrap();
        assert_eq!(report.written, 2);

        let old = mirror
            .read_relations(&tmp.path().join("zed").join(RELATIONS_FILE))
            .unwrap();
        let ids: Vec<&str> = old.iter().map(relation_key).collect();
        assert_eq!(ids, vec!["r2"]);

        let new = mirror
            .read_relations(&tmp.path().join("amy").join(RELATIONS_FILE))
            .unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0]["targetId"], "amy");
    }

    #[test]
    fn malformed_relations_file_is_rewritten() {
        let tmp = TempDir::new().unwrap();
        let mirror = MirrorStore::new(tmp.path());
        let dir = tmp.path().join("elder");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(RELATIONS_FILE), "{not json").unwrap();

        mirror.write_relation(&relation("r1", "elder")).unwrap();
        let entries = mirror.read_relations(&dir.join(RELATIONS_FILE)).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn listings_skip_reserved_and_hidden() {
        let tmp = TempDir::new().unwrap();
        for dir in ["u2", "u1", "answers/a1", "chatSessions/s1", ".locks"] {
            fs::create_dir_all(tmp.path().join(dir)).unwrap();
        }
        fs::write(tmp.path().join("stray.json"), "{}").unwrap();

        let mirror = MirrorStore::new(tmp.path());
        assert_eq!(mirror.owner_dir_names().unwrap(), vec!["u1", "u2"]);
        assert_eq!(mirror.answer_dir_names().unwrap(), vec!["a1"]);
        assert_eq!(mirror.session_dir_names().unwrap(), vec!["s1"]);
    }

    #[test]
    fn missing_root_lists_empty() {
        let tmp = TempDir::new().unwrap();
        let mirror = MirrorStore::new(tmp.path().join("nope"));
        assert!(mirror.owner_dir_names().unwrap().is_empty());
        assert!(mirror.relation_files().unwrap().is_empty());
        assert!(!mirror.tree_digest().unwrap().is_empty());
    }

    #[test]
    fn read_owner_reports_missing_pieces() {
        let tmp = TempDir::new().unwrap();
        let mirror = MirrorStore::new(tmp.path());
        mirror.write_owner(&owner("u1")).unwrap();

        let files = mirror.read_owner(&OwnerId::parse("u1").unwrap()).unwrap();
        assert!(files.profile.is_some());
        assert!(!files.is_empty());
        assert_eq!(
            files.missing(),
            vec![
                ROLE_CARD_FILE,
                SENTIMENTS_FILE,
                CONVERSATIONS_FILE,
                GUIDELINES_FILE
            ]
        );
    }

    #[test]
    fn digest_changes_with_content() {
        let tmp = TempDir::new().unwrap();
        let mirror = MirrorStore::new(tmp.path());
        mirror.write_owner(&owner("u1")).unwrap();
        let before = mirror.tree_digest().unwrap();
        assert_eq!(before, mirror.tree_digest().unwrap());

        let mut changed = owner("u1");
        changed.profile.name = Some("Grandpa".into());
        mirror.write_owner(&changed).unwrap();
        assert_ne!(before, mirror.tree_digest().unwrap());
    }
}
