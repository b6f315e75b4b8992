//! Per-turn knowledge-state updates.
//!
//! After each tutor reply the updater first asks which graph concepts the
//! reply explained, then asks for a re-estimate of those concepts' labels.
//! Every proposed label goes through [`crate::gate::clamp`] before it is
//! committed. Both steps are batched across all conversations of a round.

use crate::concept::ConceptGraph;
use crate::error::CoreResult;
use crate::gate;
use crate::json::{extract_json_object, parse_json_object};
use crate::knowledge::{KnowledgeState, MasteryLabel};
use crate::llm_client::{ChatMessage, GenerationParams, LanguageModelClient};
use crate::prompts::PromptTemplate;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const EXTRACT_SYSTEM_PROMPT: &str = "You are a professional concept extraction specialist.";
const UPDATE_SYSTEM_PROMPT: &str = "You are a professional learning assessment analyst.";
/// Placeholders filled for the explained-concept extraction prompt.
pub const EXTRACT_PROMPT_PLACEHOLDERS: [&str; 2] = ["assistant_message", "candidate_concepts"];
/// Placeholders filled for the state re-estimation prompt.
pub const UPDATE_PROMPT_PLACEHOLDERS: [&str; 5] = [
    "assistant_message",
    "extracted_concepts",
    "previous_states",
    "prerequisite_states",
    "user_response_analysis",
];
const EXTRACT_TEMPERATURE: f32 = 0.3;
const UPDATE_TEMPERATURE: f32 = 0.7;

/// Evidence from one conversation's latest round.
#[derive(Debug, Clone, Copy)]
pub struct TurnEvidence<'a> {
    pub problem_id: &'a str,
    /// The tutor's latest reply.
    pub assistant_message: &'a str,
    /// The student's utterance that preceded it.
    pub student_message: &'a str,
    pub state: &'a KnowledgeState,
}

/// Outcome of one conversation's update.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnUpdate {
    /// Concepts the tutor's reply explained, filtered to the problem's graph.
    pub explained_concepts: Vec<String>,
    pub state: KnowledgeState,
}

/// Reads `explained_concepts` out of an extraction answer, keeping only known
/// candidates.
pub fn parse_explained_concepts(text: &str, candidates: &[String]) -> Vec<String> {
    let Some(object) = extract_json_object(text) else {
        return Vec::new();
    };
    let Some(Value::Array(items)) = object.get("explained_concepts") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_str)
        .filter(|c| candidates.iter().any(|candidate| candidate == c))
        .map(str::to_string)
        .collect()
}

fn format_previous_states(scope: &[String], state: &KnowledgeState) -> String {
    if state.is_empty() {
        return "{}".to_string();
    }
    let mut formatted = Map::new();
    for concept in scope {
        if let Some(entry) = state.get(concept) {
            let label = entry.state.map(|l| l.as_str()).unwrap_or_default();
            formatted.insert(concept.clone(), json!({ "state": label }));
        }
    }
    serde_json::to_string_pretty(&formatted).unwrap_or_else(|_| "{}".to_string())
}

fn format_prerequisite_states(
    scope: &[String],
    state: &KnowledgeState,
    graph: &ConceptGraph,
    problem_id: &str,
) -> String {
    let mut formatted = Map::new();
    for node in graph.nodes(problem_id) {
        if node.id.is_empty() || !scope.contains(&node.id) {
            continue;
        }
        let prerequisites: Vec<Value> = node
            .prerequisites
            .iter()
            .map(|p| json!({ "concept": p, "state": state.label(p) }))
            .collect();
        formatted.insert(node.id.clone(), Value::Array(prerequisites));
    }
    serde_json::to_string_pretty(&formatted).unwrap_or_else(|_| "{}".to_string())
}

/// Applies a re-estimation answer to a copy of `current`.
///
/// The answer must be a JSON object of `concept -> {new_state, evidence,
/// confidence}`; otherwise `None` is returned and nothing is committed.
/// Entries are applied in response order, each gated against the state as
/// updated so far. Evidence and confidence are committed even when the label
/// is missing or unrecognised.
pub fn apply_update(
    current: &KnowledgeState,
    response: &str,
    graph: Option<&ConceptGraph>,
    problem_id: Option<&str>,
) -> Option<KnowledgeState> {
    let parsed = parse_json_object(response.trim())?;
    let mut updated = current.clone();
    for (concept, info) in parsed {
        updated.entry_mut(&concept);
        let Value::Object(info) = info else {
            continue;
        };
        let proposed = info
            .get("new_state")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<MasteryLabel>().ok());
        if let Some(proposed) = proposed {
            let committed = gate::clamp(&concept, proposed, &updated, graph, problem_id);
            if committed != proposed {
                debug!(%concept, %proposed, %committed, "Gated label upgrade");
            }
            updated.set_label(&concept, committed);
        }
        let entry = updated.entry_mut(&concept);
        entry.evidence = info
            .get("evidence")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        entry.confidence = info.get("confidence").and_then(Value::as_f64);
        entry.raw = None;
    }
    Some(updated)
}

/// Runs the two-step extraction and re-estimation protocol.
pub struct KnowledgeStateUpdater {
    client: Arc<dyn LanguageModelClient>,
    extract_template: PromptTemplate,
    update_template: PromptTemplate,
    extract_max_tokens: u32,
    update_max_tokens: u32,
}

impl KnowledgeStateUpdater {
    pub fn new(
        client: Arc<dyn LanguageModelClient>,
        extract_template: PromptTemplate,
        update_template: PromptTemplate,
    ) -> Self {
        Self {
            client,
            extract_template,
            update_template,
            extract_max_tokens: 600,
            update_max_tokens: 1200,
        }
    }

    async fn ask(
        &self,
        system: &str,
        prompts: Vec<String>,
        params: GenerationParams,
    ) -> Vec<String> {
        let contexts = prompts
            .into_iter()
            .map(|p| vec![ChatMessage::system(system), ChatMessage::user(p)])
            .collect();
        self.client
            .generate(contexts, params)
            .await
            .into_iter()
            .map(|samples| samples.into_iter().next().unwrap_or_default())
            .collect()
    }

    /// Advances every conversation in `turns` by one update.
    ///
    /// Issues one dispatcher call for all extractions, then one for all
    /// re-estimations. Results are in input order. Prompt rendering failures
    /// are returned before any model call of the failing step.
    pub async fn advance_batch(
        &self,
        turns: &[TurnEvidence<'_>],
        graph: &ConceptGraph,
    ) -> CoreResult<Vec<TurnUpdate>> {
        if turns.is_empty() {
            return Ok(Vec::new());
        }

        let candidates: Vec<Vec<String>> = turns
            .iter()
            .map(|t| graph.concept_ids(t.problem_id))
            .collect();
        let extract_prompts = turns
            .iter()
            .zip(&candidates)
            .map(|(turn, candidates)| {
                let values = HashMap::from([
                    ("assistant_message", turn.assistant_message.to_string()),
                    (
                        "candidate_concepts",
                        serde_json::to_string_pretty(candidates)?,
                    ),
                ]);
                self.extract_template.render(&values)
            })
            .collect::<CoreResult<Vec<_>>>()?;

        info!(conversations = turns.len(), "Extracting explained concepts");
        let extract_responses = self
            .ask(
                EXTRACT_SYSTEM_PROMPT,
                extract_prompts,
                GenerationParams::new(EXTRACT_TEMPERATURE, self.extract_max_tokens),
            )
            .await;
        let explained: Vec<Vec<String>> = extract_responses
            .iter()
            .zip(&candidates)
            .map(|(response, candidates)| parse_explained_concepts(response, candidates))
            .collect();

        let update_prompts = turns
            .iter()
            .zip(explained.iter().zip(&candidates))
            .map(|(turn, (explained, candidates))| {
                let scope = if explained.is_empty() {
                    candidates
                } else {
                    explained
                };
                let values = HashMap::from([
                    ("assistant_message", turn.assistant_message.to_string()),
                    ("extracted_concepts", serde_json::to_string_pretty(scope)?),
                    ("previous_states", format_previous_states(scope, turn.state)),
                    (
                        "prerequisite_states",
                        format_prerequisite_states(scope, turn.state, graph, turn.problem_id),
                    ),
                    ("user_response_analysis", turn.student_message.to_string()),
                ]);
                self.update_template.render(&values)
            })
            .collect::<CoreResult<Vec<_>>>()?;

        info!(conversations = turns.len(), "Re-estimating knowledge states");
        let update_responses = self
            .ask(
                UPDATE_SYSTEM_PROMPT,
                update_prompts,
                GenerationParams::new(UPDATE_TEMPERATURE, self.update_max_tokens),
            )
            .await;

        Ok(turns
            .iter()
            .zip(update_responses)
            .zip(explained)
            .map(|((turn, response), explained_concepts)| {
                let state = apply_update(turn.state, &response, Some(graph), Some(turn.problem_id))
                    .unwrap_or_else(|| {
                        warn!(problem_id = %turn.problem_id, "Unparsable knowledge update; state unchanged");
                        turn.state.clone()
                    });
                TurnUpdate {
                    explained_concepts,
                    state,
                }
            })
            .collect())
    }
}
