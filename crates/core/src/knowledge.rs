//! Per-conversation model of what the simulated student knows.

use crate::json::parse_json_object;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Totally ordered mastery of one concept, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryLabel {
    UnknownUnknown,
    NotIntroduced,
    Struggling,
    PartialUnderstanding,
    KnowsWell,
}

impl MasteryLabel {
    pub const ALL: [MasteryLabel; 5] = [
        MasteryLabel::UnknownUnknown,
        MasteryLabel::NotIntroduced,
        MasteryLabel::Struggling,
        MasteryLabel::PartialUnderstanding,
        MasteryLabel::KnowsWell,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MasteryLabel::UnknownUnknown => "unknown_unknown",
            MasteryLabel::NotIntroduced => "not_introduced",
            MasteryLabel::Struggling => "struggling",
            MasteryLabel::PartialUnderstanding => "partial_understanding",
            MasteryLabel::KnowsWell => "knows_well",
        }
    }
}

impl fmt::Display for MasteryLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MasteryLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        MasteryLabel::ALL
            .into_iter()
            .find(|label| label.as_str() == wanted)
            .ok_or_else(|| format!("unknown mastery label '{}'", s))
    }
}

/// What is recorded about one concept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<MasteryLabel>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub evidence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// The model's own value for this concept, kept when the typed fields
    /// above cannot reproduce it (unrecognised label, extra keys, non-object).
    #[serde(rename = "_raw", default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl KnowledgeEntry {
    pub fn with_state(state: MasteryLabel) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    fn from_model_value(value: Value) -> Self {
        let mut entry = match value.as_object() {
            Some(info) => KnowledgeEntry {
                state: info
                    .get("state")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok()),
                evidence: info
                    .get("evidence")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                confidence: info.get("confidence").and_then(Value::as_f64),
                raw: None,
            },
            None => KnowledgeEntry::default(),
        };
        if serde_json::to_value(&entry).ok().as_ref() != Some(&value) {
            entry.raw = Some(value);
        }
        entry
    }
}

/// Mapping from concept id to its recorded mastery.
///
/// A concept that is absent, or present without a label, reads as
/// `unknown_unknown`. When initialization could not parse the model's answer
/// the raw text is kept under `_raw_response` and the mapping stays empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeState {
    #[serde(
        rename = "_raw_response",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub raw_response: Option<String>,
    #[serde(flatten)]
    pub entries: BTreeMap<String, KnowledgeEntry>,
}

impl KnowledgeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = (S, MasteryLabel)>,
        S: Into<String>,
    {
        Self {
            raw_response: None,
            entries: labels
                .into_iter()
                .map(|(id, label)| (id.into(), KnowledgeEntry::with_state(label)))
                .collect(),
        }
    }

    /// Reads an initialization answer: a JSON object of
    /// `concept -> {state, evidence, confidence}`.
    ///
    /// Every concept in the answer gets an entry. Whatever the typed fields
    /// cannot represent is kept verbatim in the entry's `raw` value, so an
    /// unrecognised label carries no `state` but is not lost. Anything that is
    /// not a non-empty JSON object is kept verbatim as `_raw_response`.
    pub fn from_model_response(text: &str) -> Self {
        let parsed = match parse_json_object(text) {
            Some(map) if !map.is_empty() => map,
            _ => {
                return Self {
                    raw_response: Some(text.to_string()),
                    entries: BTreeMap::new(),
                };
            }
        };

        let entries = parsed
            .into_iter()
            .map(|(concept, value)| (concept, KnowledgeEntry::from_model_value(value)))
            .collect();
        Self {
            raw_response: None,
            entries,
        }
    }

    pub fn label(&self, concept_id: &str) -> MasteryLabel {
        self.entries
            .get(concept_id)
            .and_then(|e| e.state)
            .unwrap_or(MasteryLabel::UnknownUnknown)
    }

    pub fn get(&self, concept_id: &str) -> Option<&KnowledgeEntry> {
        self.entries.get(concept_id)
    }

    pub fn entry_mut(&mut self, concept_id: &str) -> &mut KnowledgeEntry {
        self.entries.entry(concept_id.to_string()).or_default()
    }

    pub fn set_label(&mut self, concept_id: &str, label: MasteryLabel) {
        self.entry_mut(concept_id).state = Some(label);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Compact `{concept: {"state": label}}` rendering for prompts.
    pub fn formatted(&self) -> String {
        if self.entries.is_empty() {
            return "{}".to_string();
        }
        let compact: BTreeMap<&str, serde_json::Value> = self
            .entries
            .iter()
            .map(|(concept, entry)| {
                (
                    concept.as_str(),
                    serde_json::json!({ "state": entry.state }),
                )
            })
            .collect();
        serde_json::to_string_pretty(&compact).unwrap_or_else(|_| "{}".to_string())
    }

    /// Concepts the student does not even know exist.
    pub fn unknown_unknown_concepts(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter(|c| self.label(c) == MasteryLabel::UnknownUnknown)
            .cloned()
            .collect()
    }

    /// Concepts the student is aware of and may ask about.
    pub fn askable_concepts(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter(|c| self.label(c) != MasteryLabel::UnknownUnknown)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_totally_ordered() {
        let mut sorted = MasteryLabel::ALL;
        sorted.reverse();
        sorted.sort();
        assert_eq!(sorted, MasteryLabel::ALL);
        assert!(MasteryLabel::UnknownUnknown < MasteryLabel::NotIntroduced);
        assert!(MasteryLabel::Struggling < MasteryLabel::PartialUnderstanding);
        assert!(MasteryLabel::PartialUnderstanding < MasteryLabel::KnowsWell);
    }

    #[test]
    fn test_label_parse_and_display() {
        for label in MasteryLabel::ALL {
            assert_eq!(label.to_string().parse::<MasteryLabel>().unwrap(), label);
        }
        assert_eq!(
            " Knows_Well ".parse::<MasteryLabel>().unwrap(),
            MasteryLabel::KnowsWell
        );
        assert!("mastered".parse::<MasteryLabel>().is_err());
        assert_eq!(
            serde_json::to_string(&MasteryLabel::PartialUnderstanding).unwrap(),
            "\"partial_understanding\""
        );
    }

    #[test]
    fn test_absent_concepts_read_as_unknown_unknown() {
        let mut state = KnowledgeState::from_labels([("A", MasteryLabel::KnowsWell)]);
        state.entry_mut("B").evidence = "mentioned once".to_string();
        assert_eq!(state.label("A"), MasteryLabel::KnowsWell);
        assert_eq!(state.label("B"), MasteryLabel::UnknownUnknown);
        assert_eq!(state.label("C"), MasteryLabel::UnknownUnknown);
    }

    #[test]
    fn test_from_model_response_parses_entries() {
        let text = r#"{
            "A": {"state": "knows_well", "evidence": "solved it", "confidence": 0.9},
            "B": {"state": "telepathic"},
            "C": "not an object"
        }"#;
        let state = KnowledgeState::from_model_response(text);
        assert!(state.raw_response.is_none());
        assert_eq!(state.len(), 3);
        assert_eq!(state.label("A"), MasteryLabel::KnowsWell);
        assert_eq!(state.get("A").unwrap().confidence, Some(0.9));
        assert!(state.get("A").unwrap().raw.is_none());
        assert_eq!(state.get("B").unwrap().state, None);
        assert_eq!(state.label("C"), MasteryLabel::UnknownUnknown);
    }

    #[test]
    fn test_from_model_response_keeps_unrepresentable_values() {
        let text = r#"{
            "A": {"state": "mastered", "evidence": "aced the quiz"},
            "B": {"state": "struggling", "notes": "mixes up signs"},
            "C": ["not", "an", "object"]
        }"#;
        let state = KnowledgeState::from_model_response(text);
        let original: serde_json::Value = serde_json::from_str(text).unwrap();

        let a = state.get("A").unwrap();
        assert_eq!(a.state, None);
        assert_eq!(a.evidence, "aced the quiz");
        assert_eq!(a.raw.as_ref(), Some(&original["A"]));
        assert_eq!(state.label("B"), MasteryLabel::Struggling);
        assert_eq!(state.get("B").unwrap().raw.as_ref(), Some(&original["B"]));
        assert_eq!(state.get("C").unwrap().raw.as_ref(), Some(&original["C"]));

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["A"]["_raw"]["state"], "mastered");
        let back: KnowledgeState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_from_model_response_falls_back_to_raw() {
        let state = KnowledgeState::from_model_response("I think they know algebra.");
        assert_eq!(
            state.raw_response.as_deref(),
            Some("I think they know algebra.")
        );
        assert!(state.is_empty());

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["_raw_response"], "I think they know algebra.");

        let empty = KnowledgeState::from_model_response("{}");
        assert_eq!(empty.raw_response.as_deref(), Some("{}"));
    }

    #[test]
    fn test_serialization_is_flat() {
        let state = KnowledgeState::from_labels([("A", MasteryLabel::Struggling)]);
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"A":{"state":"struggling"}}"#);
        let back: KnowledgeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_formatted_and_concept_lists() {
        let state = KnowledgeState::from_labels([
            ("A", MasteryLabel::KnowsWell),
            ("B", MasteryLabel::UnknownUnknown),
            ("C", MasteryLabel::NotIntroduced),
        ]);
        let formatted: serde_json::Value = serde_json::from_str(&state.formatted()).unwrap();
        assert_eq!(formatted["A"]["state"], "knows_well");
        assert_eq!(state.unknown_unknown_concepts(), vec!["B".to_string()]);
        assert_eq!(
            state.askable_concepts(),
            vec!["A".to_string(), "C".to_string()]
        );
        assert_eq!(KnowledgeState::new().formatted(), "{}");
    }
}
