//! Values derived from an answer when its memory file is written.

use crate::models::QuestionLayer;

/// Estimated model tokens for a text: CJK ideographs weigh 0.65, every other
/// character 1.0.
pub fn estimate_tokens(text: &str) -> u32 {
    let (cjk, other) = text.chars().fold((0u32, 0u32), |(cjk, other), c| {
        if ('\u{4e00}'..='\u{9fa5}').contains(&c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });
    (f64::from(cjk) * 0.65 + f64::from(other)).ceil() as u32
}

/// Importance in `[0, 1]`: emotional answers start higher, longer answers
/// gain up to 0.2.
pub fn assess_importance(answer: &str, layer: QuestionLayer) -> f64 {
    let base = match layer {
        QuestionLayer::Emotional => 0.8,
        QuestionLayer::Basic => 0.5,
    };
    let length_bonus = (answer.chars().count() as f64 / 200.0).min(0.2);
    (base + length_bonus).min(1.0)
}

const TAG_KEYWORDS: [(&str, &[&str]); 5] = [
    ("positive", &["开心", "快乐", "幸福"]),
    ("negative", &["难过", "伤心", "痛苦"]),
    ("family", &["家庭", "家人"]),
    ("work", &["工作", "事业"]),
    ("social", &["朋友", "同事"]),
];

pub const FALLBACK_TAG: &str = "其他";

/// Keyword tags matched against question and answer together.
pub fn extract_tags(question: &str, answer: &str) -> Vec<String> {
    let text = format!("{}{}", question, answer);
    let tags: Vec<String> = TAG_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
        .map(|(tag, _)| tag.to_string())
        .collect();

    if tags.is_empty() {
        vec![FALLBACK_TAG.to_string()]
    } else {
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_weigh_cjk_lower() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 4);
        // 2 × 0.65 = 1.3 → 2
        assert_eq!(estimate_tokens("开心"), 2);
        // 3 × 0.65 + 2 = 3.95 → 4
        assert_eq!(estimate_tokens("我很好!!"), 4);
    }

    #[test]
    fn importance_baseline_and_cap() {
        assert_eq!(assess_importance("", QuestionLayer::Basic), 0.5);
        assert_eq!(assess_importance("", QuestionLayer::Emotional), 0.8);
        let long = "x".repeat(1000);
        assert!((assess_importance(&long, QuestionLayer::Basic) - 0.7).abs() < 1e-9);
        assert!((assess_importance(&long, QuestionLayer::Emotional) - 1.0).abs() < 1e-9);
        let mid = "x".repeat(20);
        assert!((assess_importance(&mid, QuestionLayer::Basic) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn tags_match_question_and_answer() {
        assert_eq!(
            extract_tags("你和家人在一起开心吗", "很幸福"),
            vec!["positive", "family"]
        );
        assert_eq!(extract_tags("工作", "朋友"), vec!["work", "social"]);
        assert_eq!(extract_tags("What is your name?", "Li"), vec![FALLBACK_TAG]);
    }

    #[test]
    fn tags_match_across_the_join() {
        assert_eq!(extract_tags("最在乎的是家", "庭"), vec!["family"]);
    }
}
