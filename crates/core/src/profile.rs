//! Interaction-style profiles for the simulated student.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One trait of how a student interacts, e.g. how often they ask for hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionFeature {
    #[serde(rename = "Feature Name")]
    pub name: String,
    #[serde(rename = "Feature Question Answer", default)]
    pub answer: String,
}

/// Keeps features whose name is in `allowed`. An empty `allowed` keeps all.
pub fn filter_profile_features(
    features: Vec<InteractionFeature>,
    allowed: &[String],
) -> Vec<InteractionFeature> {
    if allowed.is_empty() {
        return features;
    }
    let allowed: HashSet<&str> = allowed.iter().map(String::as_str).collect();
    features
        .into_iter()
        .filter(|f| allowed.contains(f.name.as_str()))
        .collect()
}

pub fn format_interaction_profile(features: &[InteractionFeature], length_text: &str) -> String {
    let mut lines = vec![
        "## Interaction Style".to_string(),
        format!(
            "- Length of User Message: The user's query/response is always {}.",
            length_text
        ),
    ];
    lines.extend(
        features
            .iter()
            .map(|f| format!("- {}: {}", f.name, f.answer)),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> Vec<InteractionFeature> {
        serde_json::from_str(
            r#"[
                {"Feature Name": "Hint Seeking", "Feature Question Answer": "Rarely asks for hints."},
                {"Feature Name": "Tone", "Feature Question Answer": "Casual."}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_filter_keeps_allowed_names() {
        let kept = filter_profile_features(features(), &["Tone".to_string()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].answer, "Casual.");
        assert_eq!(filter_profile_features(features(), &[]).len(), 2);
    }

    #[test]
    fn test_format_profile() {
        let text = format_interaction_profile(&features()[..1], "around 20 words");
        assert_eq!(
            text,
            "## Interaction Style\n\
             - Length of User Message: The user's query/response is always around 20 words.\n\
             - Hint Seeking: Rarely asks for hints."
        );
        assert_eq!(format_interaction_profile(&[], "x").lines().count(), 2);
    }
}
