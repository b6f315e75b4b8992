//! Hard gating of mastery labels by prerequisite state.
//!
//! A concept cannot be recorded above `struggling` while any of its direct
//! prerequisites is still `unknown_unknown` or `not_introduced`. Lookups are a
//! single hop through the graph, so cyclic graphs are handled without special
//! casing.

use crate::concept::ConceptGraph;
use crate::knowledge::{KnowledgeState, MasteryLabel};

/// The highest label a concept may hold while a prerequisite is unmet.
pub const GATED_CEILING: MasteryLabel = MasteryLabel::Struggling;

fn is_unmet(label: MasteryLabel) -> bool {
    matches!(
        label,
        MasteryLabel::UnknownUnknown | MasteryLabel::NotIntroduced
    )
}

/// Clamps a proposed label against the current state of the concept's
/// prerequisites. Never raises a label.
///
/// Without a graph or problem context, or for a concept with no listed
/// prerequisites, the proposal is returned unchanged.
pub fn clamp(
    concept_id: &str,
    proposed: MasteryLabel,
    current: &KnowledgeState,
    graph: Option<&ConceptGraph>,
    problem_id: Option<&str>,
) -> MasteryLabel {
    let (Some(graph), Some(problem_id)) = (graph, problem_id) else {
        return proposed;
    };
    let prerequisites = graph.prerequisites(problem_id, concept_id);
    if prerequisites.is_empty() {
        return proposed;
    }
    if prerequisites.iter().any(|p| is_unmet(current.label(p))) {
        proposed.min(GATED_CEILING)
    } else {
        proposed
    }
}
