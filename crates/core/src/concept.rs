//! Concept nodes and per-problem prerequisite graphs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A single concept of one problem.
///
/// The identifier is fixed once the node exists; only its prerequisite list
/// may grow while the graph is being built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptNode {
    #[serde(rename = "concept_id")]
    pub id: String,
    pub description: String,
    pub prerequisites: Vec<String>,
}

impl ConceptNode {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            prerequisites: Vec::new(),
        }
    }

    pub fn with_prerequisites(mut self, prerequisites: &[&str]) -> Self {
        for p in prerequisites {
            self.add_prerequisite(p);
        }
        self
    }

    /// Appends a prerequisite unless it is empty, the node itself, or already listed.
    pub fn add_prerequisite(&mut self, id: &str) {
        if id.is_empty() || id == self.id || self.prerequisites.iter().any(|p| p == id) {
            return;
        }
        self.prerequisites.push(id.to_string());
    }
}

/// A concept as it comes out of the raw per-problem extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedConcept {
    #[serde(rename = "Concept Name")]
    pub name: String,
    #[serde(rename = "Concept Explanation", default)]
    pub explanation: String,
}

/// Lower-cases and collapses runs of whitespace, for name matching.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Mapping from problem id to that problem's ordered concept nodes.
///
/// Every prerequisite id listed by a node names a node of the same problem.
/// The graph may contain cycles; readers must only ever follow one hop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptGraph {
    problems: BTreeMap<String, Vec<ConceptNode>>,
}

impl ConceptGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a problem's nodes, dropping prerequisite references that do not
    /// resolve within the problem.
    ///
    /// Repeated ids collapse into the first occurrence: its description is
    /// kept and the prerequisite lists are merged in order.
    pub fn insert(&mut self, problem_id: impl Into<String>, nodes: Vec<ConceptNode>) {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut merged: Vec<ConceptNode> = Vec::with_capacity(nodes.len());
        for node in nodes {
            if let Some(&at) = positions.get(&node.id) {
                for prerequisite in &node.prerequisites {
                    merged[at].add_prerequisite(prerequisite);
                }
            } else {
                positions.insert(node.id.clone(), merged.len());
                merged.push(node);
            }
        }

        let ids: HashSet<String> = positions.into_keys().collect();
        for node in &mut merged {
            let own = node.id.clone();
            node.prerequisites.retain(|p| p != &own && ids.contains(p));
        }
        self.problems.insert(problem_id.into(), merged);
    }

    /// Builds the phase-zero graph from raw extraction, skipping blank names.
    ///
    /// Names equal after normalization are one concept, spelled as first seen.
    pub fn seed(extracted: &BTreeMap<String, Vec<ExtractedConcept>>) -> Self {
        let mut graph = Self::new();
        for (problem_id, concepts) in extracted {
            let mut seen = HashSet::new();
            let nodes = concepts
                .iter()
                .filter(|c| !c.name.trim().is_empty())
                .filter(|c| seen.insert(normalize_name(&c.name)))
                .map(|c| ConceptNode::new(c.name.trim(), c.explanation.trim()))
                .collect();
            graph.insert(problem_id.clone(), nodes);
        }
        graph
    }

    /// Converts IU graphs into concept graphs with readable `"<id>: <concept>"`
    /// identifiers. Also returns the per-problem IU id to label map.
    pub fn from_iu_graphs(
        iu_graphs: &BTreeMap<String, IuGraph>,
    ) -> (Self, BTreeMap<String, HashMap<String, String>>) {
        let mut graph = Self::new();
        let mut id_maps = BTreeMap::new();
        for (problem_id, iu_graph) in iu_graphs {
            let labels: HashMap<String, String> = iu_graph
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.label()))
                .collect();

            let mut nodes: Vec<ConceptNode> = iu_graph
                .nodes
                .iter()
                .map(|n| ConceptNode::new(n.label(), n.description.clone()))
                .collect();
            for edge in &iu_graph.edges {
                let (Some(from), Some(to)) = (labels.get(&edge.from), labels.get(&edge.to)) else {
                    continue;
                };
                if let Some(target) = nodes.iter_mut().find(|n| &n.id == to) {
                    target.add_prerequisite(from);
                }
            }
            graph.insert(problem_id.clone(), nodes);
            id_maps.insert(problem_id.clone(), labels);
        }
        (graph, id_maps)
    }

    pub fn nodes(&self, problem_id: &str) -> &[ConceptNode] {
        self.problems
            .get(problem_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn nodes_mut(&mut self, problem_id: &str) -> Option<&mut Vec<ConceptNode>> {
        self.problems.get_mut(problem_id)
    }

    pub fn node(&self, problem_id: &str, concept_id: &str) -> Option<&ConceptNode> {
        self.nodes(problem_id).iter().find(|n| n.id == concept_id)
    }

    /// One-hop prerequisite lookup; empty when the concept is unknown.
    pub fn prerequisites(&self, problem_id: &str, concept_id: &str) -> &[String] {
        self.node(problem_id, concept_id)
            .map(|n| n.prerequisites.as_slice())
            .unwrap_or(&[])
    }

    pub fn concept_ids(&self, problem_id: &str) -> Vec<String> {
        self.nodes(problem_id)
            .iter()
            .filter(|n| !n.id.is_empty())
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn problem_ids(&self) -> impl Iterator<Item = &String> {
        self.problems.keys()
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }
}

/// One information unit of an extracted IU graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IuNode {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub concept: String,
    #[serde(default)]
    pub description: String,
}

impl IuNode {
    /// Stable human-readable identifier used as the concept id.
    pub fn label(&self) -> String {
        match (self.id.is_empty(), self.concept.is_empty()) {
            (false, false) => format!("{}: {}", self.id, self.concept),
            (false, true) => self.id.clone(),
            _ => self.concept.clone(),
        }
    }
}

/// A directed edge: `from` is a prerequisite of `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IuEdge {
    pub from: String,
    pub to: String,
}

/// Raw per-problem extraction: information units plus prerequisite edges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IuGraph {
    #[serde(default)]
    pub nodes: Vec<IuNode>,
    #[serde(default)]
    pub edges: Vec<IuEdge>,
}

/// Reads an IU identifier, which models emit as either a string or a number.
fn iu_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn object_items<'a>(object: &'a Map<String, Value>, key: &str) -> Vec<&'a Map<String, Value>> {
    object
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

fn text_field(item: &Map<String, Value>, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

impl IuGraph {
    /// Reads nodes and edges one element at a time.
    ///
    /// A malformed element is skipped on its own: a node without any id or
    /// concept, or an edge missing an endpoint, never costs the rest of the
    /// graph.
    pub fn from_json(object: &Map<String, Value>) -> Self {
        let nodes = object_items(object, "nodes")
            .into_iter()
            .map(|item| IuNode {
                id: iu_id(item.get("id")).unwrap_or_default(),
                concept: text_field(item, "concept"),
                description: text_field(item, "description"),
            })
            .filter(|node| !node.label().is_empty())
            .collect();
        let edges = object_items(object, "edges")
            .into_iter()
            .filter_map(|item| {
                let from = iu_id(item.get("from")).filter(|id| !id.is_empty())?;
                let to = iu_id(item.get("to")).filter(|id| !id.is_empty())?;
                Some(IuEdge { from, to })
            })
            .collect();
        Self { nodes, edges }
    }
}

/// Renders one line per concept: id, description and its prerequisites.
pub fn format_concept_list_with_prerequisites(nodes: &[ConceptNode]) -> String {
    nodes
        .iter()
        .map(|node| {
            let prerequisites = if node.prerequisites.is_empty() {
                "none listed".to_string()
            } else {
                node.prerequisites.join(", ")
            };
            format!(
                "- {}: {} (prerequisites: {})",
                node.id, node.description, prerequisites
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
