//! Per-answer memory files.
//!
//! Each answer lands twice in the mirror: the raw snapshot under
//! `answers/<id>/answer.json` and a derived memory file inside the owner's
//! directory, filed by who answered:
//!
//! | Relationship | Path under `<owner>/` |
//! |--------------|-----------------------|
//! | self | `A_set/self/<layer>/question_<n>.json` |
//! | family | `B_sets/<contributor>/<layer>/question_<n>.json` |
//! | friend | `C_sets/<contributor>/<layer>/question_<n>.json` |

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::derive::{assess_importance, estimate_tokens, extract_tags};
use crate::error::MirrorResult;
use crate::models::{AnswerRecord, AnswerRelationship, QuestionLayer};

use super::{write_json, MirrorStore, WriteReport};

pub const SELF_CATEGORY: &str = "A_set";
pub const FAMILY_CATEGORY: &str = "B_sets";
pub const FRIEND_CATEGORY: &str = "C_sets";
pub const SELF_CONTRIBUTOR: &str = "self";

/// The memory file body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerMemory {
    pub memory_id: String,
    pub question_id: String,
    pub question: String,
    pub question_role: AnswerRelationship,
    pub question_layer: QuestionLayer,
    pub question_order: u32,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_nickname: Option<String>,
    pub token_count: u32,
    pub importance: f64,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnswerMemory {
    pub fn from_answer(answer: &AnswerRecord) -> Self {
        let helper = answer.relationship != AnswerRelationship::SelfAnswer;
        Self {
            memory_id: answer.id.to_string(),
            question_id: answer.question_id.clone(),
            question: answer.question_text.clone(),
            question_role: answer.relationship,
            question_layer: answer.question_layer,
            question_order: answer.question_order,
            answer: answer.answer.clone(),
            helper_id: helper.then(|| answer.contributor_id.to_string()),
            helper_nickname: if helper {
                answer.contributor_nickname.clone()
            } else {
                None
            },
            token_count: estimate_tokens(&answer.answer),
            importance: assess_importance(&answer.answer, answer.question_layer),
            tags: extract_tags(&answer.question_text, &answer.answer),
            created_at: answer.created_at,
            updated_at: answer.updated_at,
        }
    }
}

pub fn category(relationship: AnswerRelationship) -> &'static str {
    match relationship {
        AnswerRelationship::SelfAnswer => SELF_CATEGORY,
        AnswerRelationship::Family => FAMILY_CATEGORY,
        AnswerRelationship::Friend => FRIEND_CATEGORY,
    }
}

/// Directory name for whoever wrote the answer.
pub fn contributor_segment(answer: &AnswerRecord) -> String {
    if answer.relationship == AnswerRelationship::SelfAnswer {
        return SELF_CONTRIBUTOR.to_string();
    }
    let nickname = answer
        .contributor_nickname
        .as_deref()
        .map(sanitize_segment)
        .unwrap_or_default();
    if nickname.is_empty() {
        format!("helper_{}", answer.contributor_id)
    } else {
        format!("{}_{}", answer.contributor_id, nickname)
    }
}

pub fn memory_file_name(order: u32) -> String {
    format!("question_{}.json", order)
}

/// Free text made safe for use as one path segment.
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

impl MirrorStore {
    pub fn memory_path(&self, answer: &AnswerRecord) -> PathBuf {
        self.owner_dir(&answer.owner_id)
            .join(category(answer.relationship))
            .join(contributor_segment(answer))
            .join(answer.question_layer.as_str())
            .join(memory_file_name(answer.question_order))
    }

    /// Write the answer snapshot and its derived memory file.
    pub fn write_answer(&self, answer: &AnswerRecord) -> MirrorResult<WriteReport> {
        let mut report = WriteReport::default();
        report.record(write_json(&self.answer_path(&answer.id), answer)?);

        let memory = AnswerMemory::from_answer(answer);
        report.record(write_json(&self.memory_path(answer), &memory)?);

        debug!(answer = %answer.id, owner = %answer.owner_id, "answer mirrored");
        Ok(report)
    }
}
