//! Concept Graph Construction
//!
//! This module turns raw per-problem extractions into concept graphs. Two
//! sources are supported:
//!
//! * `ConceptGraphBuilder` starts from named concepts and runs two batched
//!   model passes: relation discovery among the listed concepts, then
//!   generation of more foundational prerequisites.
//! * `IuExtractor` asks the model for an information-unit graph (nodes plus
//!   prerequisite edges) per problem, which `ConceptGraph::from_iu_graphs`
//!   converts into concept nodes.
//!
//! Every pass issues all of its requests in one dispatcher call before any
//! response is parsed. An unparsable response contributes nothing for its item.

use crate::concept::{ConceptGraph, ConceptNode, ExtractedConcept, IuGraph, normalize_name};
use crate::error::CoreResult;
use crate::json::{extract_json_array, extract_json_object};
use crate::llm_client::{ChatMessage, GenerationParams, LanguageModelClient};
use crate::prompts::PromptTemplate;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

const RELATION_TEMPERATURE: f32 = 0.2;
const GENERATION_TEMPERATURE: f32 = 0.6;
const IU_TEMPERATURE: f32 = 0.2;
const IU_RETRY_TEMPERATURE: f32 = 0.0;
const IU_RETRY_SUFFIX: &str = "\n\nReturn only valid JSON. Do not include any extra text.";
/// Placeholders filled for the IU extraction prompt.
pub const IU_PROMPT_PLACEHOLDERS: [&str; 2] = ["question", "answer"];
const IU_SYSTEM_PROMPT: &str = "You are an expert knowledge graph extractor.";

fn relation_prompt(concept_list: &str) -> String {
    format!(
        "You are given a list of concepts for a single math problem.\n\
         Identify prerequisite relationships among ONLY these concepts.\n\
         Return JSON in this format:\n\
         {{\n  \"prerequisites\": {{\n    \"Concept A\": [\"Concept B\", \"Concept C\"],\n    \"Concept B\": []\n  }}\n}}\n\
         Rules:\n\
         - Only include prerequisite concepts that appear in the provided list.\n\
         - If no prerequisites, use an empty list.\n\
         - Do not invent new concepts.\n\
         Concept list:\n{}",
        concept_list
    )
}

fn generation_prompt(target: &ConceptNode, existing: &str) -> String {
    format!(
        "You are given a target concept from a math problem.\n\
         Generate 1-3 prerequisite concepts that are more foundational.\n\
         Return JSON in this format:\n\
         {{\n  \"prerequisites\": [\n    {{\"concept_id\": \"Prereq 1\", \"description\": \"Short description\"}},\n    {{\"concept_id\": \"Prereq 2\", \"description\": \"Short description\"}}\n  ]\n}}\n\
         Rules:\n\
         - Do not include the target concept itself.\n\
         - Keep descriptions short and factual.\n\
         - Avoid duplicates with the existing concept list unless truly necessary.\n\
         Target concept: {}\n\
         Target description: {}\n\
         Existing concepts: {}",
        target.id, target.description, existing
    )
}

/// Reads a relation answer: `{"prerequisites": {name: [names]}}`, or the bare
/// mapping itself.
fn parse_relations(text: &str) -> Map<String, Value> {
    let Some(mut object) = extract_json_object(text) else {
        return Map::new();
    };
    match object.remove("prerequisites") {
        Some(Value::Object(mapping)) => mapping,
        Some(_) => Map::new(),
        None => object,
    }
}

/// A prerequisite proposed for a target concept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedPrerequisite {
    pub name: String,
    pub description: String,
}

/// Reads a generation answer: `{"prerequisites": [{concept_id, description}]}`,
/// or a bare list of the same items.
fn parse_proposals(text: &str) -> Vec<ProposedPrerequisite> {
    let items = match extract_json_object(text) {
        Some(mut object) => match object.remove("prerequisites") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        None => extract_json_array(text).unwrap_or_default(),
    };
    items
        .iter()
        .filter_map(|item| {
            let item = item.as_object()?;
            let name = item.get("concept_id")?.as_str()?.trim().to_string();
            let description = item
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .trim()
                .to_string();
            Some(ProposedPrerequisite { name, description })
        })
        .collect()
}

fn value_to_name(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string().trim().to_string(),
    }
}

/// Applies discovered edges among existing nodes only.
///
/// Names are matched case-insensitively after whitespace normalization;
/// unknown names and self-references are ignored. Never creates nodes.
pub fn apply_relations(nodes: &mut [ConceptNode], relations: &Map<String, Value>) {
    let index: HashMap<String, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (normalize_name(&n.id), i))
        .collect();

    for (concept_name, prerequisites) in relations {
        let Some(&target) = index.get(&normalize_name(concept_name)) else {
            continue;
        };
        let Some(prerequisites) = prerequisites.as_array() else {
            continue;
        };
        for prerequisite in prerequisites {
            let name = value_to_name(prerequisite);
            if name.is_empty() {
                continue;
            }
            match index.get(&normalize_name(&name)) {
                Some(&source) if source != target => {
                    let source_id = nodes[source].id.clone();
                    nodes[target].add_prerequisite(&source_id);
                }
                _ => {}
            }
        }
    }
}

/// Links a target concept to proposed prerequisites, creating nodes for
/// proposals that do not match any existing concept.
pub fn apply_proposals(
    nodes: &mut Vec<ConceptNode>,
    target_id: &str,
    proposals: &[ProposedPrerequisite],
) {
    let target_norm = normalize_name(target_id);
    let Some(target) = nodes.iter().position(|n| normalize_name(&n.id) == target_norm) else {
        return;
    };

    for proposal in proposals {
        let norm = normalize_name(&proposal.name);
        if norm.is_empty() || norm == target_norm {
            continue;
        }
        let source = match nodes.iter().position(|n| normalize_name(&n.id) == norm) {
            Some(existing) => existing,
            None => {
                nodes.push(ConceptNode::new(
                    proposal.name.clone(),
                    proposal.description.clone(),
                ));
                nodes.len() - 1
            }
        };
        let source_id = nodes[source].id.clone();
        nodes[target].add_prerequisite(&source_id);
    }
}

/// Builds per-problem concept graphs from named concepts.
pub struct ConceptGraphBuilder {
    client: Arc<dyn LanguageModelClient>,
    max_tokens: u32,
}

impl ConceptGraphBuilder {
    pub fn new(client: Arc<dyn LanguageModelClient>) -> Self {
        Self {
            client,
            max_tokens: 800,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Seeds the graph from the raw extraction, then runs both model passes.
    pub async fn build(
        &self,
        extracted: &BTreeMap<String, Vec<ExtractedConcept>>,
    ) -> ConceptGraph {
        let mut graph = ConceptGraph::seed(extracted);
        self.discover_relations(&mut graph).await;
        self.generate_prerequisites(&mut graph).await;
        graph
    }

    /// Finds prerequisite edges among the concepts already listed per problem.
    pub async fn discover_relations(&self, graph: &mut ConceptGraph) {
        let mut problem_ids = Vec::new();
        let mut contexts = Vec::new();
        for problem_id in graph.problem_ids() {
            let nodes = graph.nodes(problem_id);
            if nodes.len() <= 1 {
                continue;
            }
            let listing: Vec<Value> = nodes
                .iter()
                .map(|n| serde_json::json!({"concept_id": n.id, "description": n.description}))
                .collect();
            let listing = serde_json::to_string_pretty(&listing).unwrap_or_default();
            contexts.push(vec![ChatMessage::user(relation_prompt(&listing))]);
            problem_ids.push(problem_id.clone());
        }
        if contexts.is_empty() {
            return;
        }

        info!(problems = contexts.len(), "Discovering prerequisite relations");
        let responses = self
            .client
            .generate(
                contexts,
                GenerationParams::new(RELATION_TEMPERATURE, self.max_tokens),
            )
            .await;

        for (problem_id, samples) in problem_ids.iter().zip(responses) {
            let text = samples.first().map(String::as_str).unwrap_or_default();
            let relations = parse_relations(text);
            if relations.is_empty() {
                warn!(%problem_id, "No usable prerequisite relations in response");
                continue;
            }
            if let Some(nodes) = graph.nodes_mut(problem_id) {
                apply_relations(nodes, &relations);
            }
        }
    }

    /// Proposes foundational prerequisites for every concept present before
    /// this pass; concepts created here are not expanded further.
    pub async fn generate_prerequisites(&self, graph: &mut ConceptGraph) {
        let mut targets = Vec::new();
        let mut contexts = Vec::new();
        for problem_id in graph.problem_ids() {
            let nodes = graph.nodes(problem_id);
            let existing: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
            let existing = serde_json::to_string(&existing).unwrap_or_default();
            for node in nodes {
                contexts.push(vec![ChatMessage::user(generation_prompt(node, &existing))]);
                targets.push((problem_id.clone(), node.id.clone()));
            }
        }
        if contexts.is_empty() {
            return;
        }

        info!(concepts = contexts.len(), "Generating foundational prerequisites");
        let responses = self
            .client
            .generate(
                contexts,
                GenerationParams::new(GENERATION_TEMPERATURE, self.max_tokens),
            )
            .await;

        for ((problem_id, concept_id), samples) in targets.iter().zip(responses) {
            let text = samples.first().map(String::as_str).unwrap_or_default();
            let proposals = parse_proposals(text);
            if let Some(nodes) = graph.nodes_mut(problem_id) {
                apply_proposals(nodes, concept_id, &proposals);
            }
        }
    }
}

/// A question/reference-answer pair to extract an IU graph from.
#[derive(Debug, Clone)]
pub struct IuSource {
    pub problem_id: String,
    pub question: String,
    pub answer: String,
}

fn parse_iu_graph(text: &str) -> Option<IuGraph> {
    let object = extract_json_object(text).filter(|o| !o.is_empty())?;
    Some(IuGraph::from_json(&object))
}

/// Extracts information-unit graphs with one stricter retry per problem.
pub struct IuExtractor {
    client: Arc<dyn LanguageModelClient>,
    template: PromptTemplate,
    max_tokens: u32,
}

impl IuExtractor {
    pub fn new(client: Arc<dyn LanguageModelClient>, template: PromptTemplate) -> Self {
        Self {
            client,
            template,
            max_tokens: 1200,
        }
    }

    async fn request(&self, prompts: &[String], temperature: f32) -> Vec<Option<IuGraph>> {
        let contexts = prompts
            .iter()
            .map(|p| vec![ChatMessage::system(IU_SYSTEM_PROMPT), ChatMessage::user(p.clone())])
            .collect();
        self.client
            .generate(
                contexts,
                GenerationParams::new(temperature, self.max_tokens).json(),
            )
            .await
            .iter()
            .map(|samples| parse_iu_graph(samples.first().map(String::as_str).unwrap_or_default()))
            .collect()
    }

    /// Extracts one graph per source. A problem whose extraction fails twice
    /// gets an empty graph; rendering errors are returned to the caller.
    pub async fn extract_batch(&self, sources: &[IuSource]) -> CoreResult<BTreeMap<String, IuGraph>> {
        let prompts = sources
            .iter()
            .map(|s| {
                let values = HashMap::from([
                    ("question", s.question.clone()),
                    ("answer", s.answer.clone()),
                ]);
                self.template.render(&values)
            })
            .collect::<CoreResult<Vec<_>>>()?;

        let mut graphs = self.request(&prompts, IU_TEMPERATURE).await;

        let retry_indexes: Vec<usize> = (0..sources.len()).filter(|&i| graphs[i].is_none()).collect();
        if !retry_indexes.is_empty() {
            warn!(count = retry_indexes.len(), "Retrying unparsable IU extractions");
            let retry_prompts: Vec<String> = retry_indexes
                .iter()
                .map(|&i| format!("{}{}", prompts[i], IU_RETRY_SUFFIX))
                .collect();
            let retried = self.request(&retry_prompts, IU_RETRY_TEMPERATURE).await;
            for (i, graph) in retry_indexes.into_iter().zip(retried) {
                graphs[i] = graph;
            }
        }

        Ok(sources
            .iter()
            .zip(graphs)
            .map(|(source, graph)| {
                let graph = graph.unwrap_or_else(|| {
                    let err = crate::error::CoreError::IuExtraction(source.problem_id.clone());
                    warn!(problem_id = %source.problem_id, error = %err, "Using an empty concept graph");
                    IuGraph::default()
                });
                (source.problem_id.clone(), graph)
            })
            .collect())
    }
}
