//! Initial knowledge states (K0) for a batch of problems.
//!
//! Two mutually exclusive strategies are offered through `InitStrategy`:
//! asking a model to diagnose the student from the concept list, or sampling
//! a state from the graph topology for a target proficiency profile.

use crate::concept::{ConceptGraph, ConceptNode, format_concept_list_with_prerequisites};
use crate::error::{CoreError, CoreResult};
use crate::knowledge::{KnowledgeState, MasteryLabel};
use crate::llm_client::{ChatMessage, GenerationParams, LanguageModelClient};
use crate::prompts::PromptTemplate;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Topo;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

const KNOWN_ACCEPT_PROBABILITY: f64 = 0.7;
const PARTIAL_ACCEPT_PROBABILITY: f64 = 0.5;
const LLM_INIT_TEMPERATURE: f32 = 0.7;
/// Placeholders filled for the model-diagnosed initialization prompt.
pub const LLM_INIT_PLACEHOLDERS: [&str; 4] = [
    "math_problem",
    "concept_list_with_prerequisites",
    "education_level",
    "indicators",
];
const LLM_INIT_SYSTEM_PROMPT: &str = "You are an expert educational diagnostician.";

/// Target proficiency of the simulated student.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProficiencyProfile {
    Novice,
    Intermediate,
    Advanced,
}

impl ProficiencyProfile {
    /// Sampling range for the fraction of concepts that are known.
    pub fn known_range(&self) -> (f64, f64) {
        match self {
            ProficiencyProfile::Novice => (0.0, 0.1),
            ProficiencyProfile::Intermediate => (0.2, 0.4),
            ProficiencyProfile::Advanced => (0.5, 0.7),
        }
    }

    /// Sampling range for the fraction of concepts that are partially known.
    pub fn partial_range(&self) -> (f64, f64) {
        match self {
            ProficiencyProfile::Novice => (0.05, 0.15),
            ProficiencyProfile::Intermediate | ProficiencyProfile::Advanced => (0.1, 0.2),
        }
    }
}

impl FromStr for ProficiencyProfile {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "novice" => Ok(ProficiencyProfile::Novice),
            "intermediate" => Ok(ProficiencyProfile::Intermediate),
            "advanced" => Ok(ProficiencyProfile::Advanced),
            _ => Err(CoreError::UnsupportedProfile(s.to_string())),
        }
    }
}

impl fmt::Display for ProficiencyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProficiencyProfile::Novice => write!(f, "novice"),
            ProficiencyProfile::Intermediate => write!(f, "intermediate"),
            ProficiencyProfile::Advanced => write!(f, "advanced"),
        }
    }
}

/// Settings for model-based initialization.
#[derive(Debug, Clone)]
pub struct LlmInitSettings {
    /// Template with `math_problem`, `concept_list_with_prerequisites`,
    /// `education_level` and `indicators` placeholders.
    pub template: PromptTemplate,
    pub education_level: String,
    pub indicators: String,
}

/// How initial knowledge states are produced for a run.
#[derive(Debug, Clone)]
pub enum InitStrategy {
    Llm(LlmInitSettings),
    Sampling {
        profile: ProficiencyProfile,
        seed: u64,
    },
}

/// Membership of each concept after sampling, in topological order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub known: Vec<String>,
    pub partially_known: Vec<String>,
    pub unknown: Vec<String>,
}

/// Orders concepts so that every prerequisite precedes its dependents.
///
/// Nodes on a cycle, and nodes that depend on one, are never reached by the
/// traversal and are returned separately in node order.
pub fn topological_order(nodes: &[ConceptNode]) -> (Vec<String>, Vec<String>) {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for node in nodes {
        graph.add_node(node.id.as_str());
    }
    for node in nodes {
        for prerequisite in &node.prerequisites {
            if graph.contains_node(prerequisite.as_str()) {
                graph.add_edge(prerequisite.as_str(), node.id.as_str(), ());
            }
        }
    }

    let mut order = Vec::with_capacity(nodes.len());
    let mut topo = Topo::new(&graph);
    while let Some(id) = topo.next(&graph) {
        order.push(id.to_string());
    }

    let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
    let cyclic = nodes
        .iter()
        .filter(|n| !placed.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect();
    (order, cyclic)
}

/// Splits a problem's concepts into known / partially known / unknown.
///
/// Walks the topological order once, accepting a node as known with
/// probability 0.7 when all of its prerequisites are known, until the sampled
/// known count is reached. Remaining nodes with at least one known
/// prerequisite become partially known with probability 0.5 up to the sampled
/// partial count. Everything else, including nodes on cycles, is unknown.
/// Both targets are fractions of the ordered nodes only.
pub fn sample_partition(
    nodes: &[ConceptNode],
    profile: ProficiencyProfile,
    rng: &mut impl Rng,
) -> Partition {
    let (order, cyclic) = topological_order(nodes);
    let total = order.len() as f64;

    let (known_lo, known_hi) = profile.known_range();
    let (partial_lo, partial_hi) = profile.partial_range();
    let known_ratio = rng.random_range(known_lo..=known_hi);
    let partial_ratio = rng.random_range(partial_lo..=partial_hi);
    let target_known = (known_ratio * total) as usize;
    let target_partial = (partial_ratio * total) as usize;

    let prerequisites: HashMap<&str, &[String]> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.prerequisites.as_slice()))
        .collect();

    let mut known: HashSet<String> = HashSet::new();
    for id in &order {
        if known.len() >= target_known {
            break;
        }
        let all_known = prerequisites[id.as_str()].iter().all(|p| known.contains(p));
        if all_known && rng.random::<f64>() < KNOWN_ACCEPT_PROBABILITY {
            known.insert(id.clone());
        }
    }

    let mut partial: HashSet<String> = HashSet::new();
    for id in order.iter().filter(|id| !known.contains(*id)) {
        if partial.len() >= target_partial {
            break;
        }
        let any_known = prerequisites[id.as_str()].iter().any(|p| known.contains(p));
        if any_known && rng.random::<f64>() < PARTIAL_ACCEPT_PROBABILITY {
            partial.insert(id.clone());
        }
    }

    let mut partition = Partition::default();
    for id in order.into_iter().chain(cyclic) {
        if known.contains(&id) {
            partition.known.push(id);
        } else if partial.contains(&id) {
            partition.partially_known.push(id);
        } else {
            partition.unknown.push(id);
        }
    }
    partition
}

/// Maps partition membership onto mastery labels.
pub fn label_partition(nodes: &[ConceptNode], partition: &Partition) -> KnowledgeState {
    let known: HashSet<&str> = partition.known.iter().map(String::as_str).collect();
    let prerequisites: HashMap<&str, &[String]> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.prerequisites.as_slice()))
        .collect();
    let known_prerequisites = |id: &str| -> (usize, usize) {
        let prereqs = prerequisites.get(id).copied().unwrap_or(&[]);
        let hits = prereqs.iter().filter(|p| known.contains(p.as_str())).count();
        (hits, prereqs.len())
    };

    let mut state = KnowledgeState::new();
    for id in &partition.known {
        state.set_label(id, MasteryLabel::KnowsWell);
    }
    for id in &partition.partially_known {
        let (hits, total) = known_prerequisites(id);
        let ratio = hits as f64 / total.max(1) as f64;
        let label = if ratio >= 0.5 {
            MasteryLabel::PartialUnderstanding
        } else {
            MasteryLabel::Struggling
        };
        state.set_label(id, label);
    }
    for id in &partition.unknown {
        let (hits, _) = known_prerequisites(id);
        let label = if hits > 0 {
            MasteryLabel::NotIntroduced
        } else {
            MasteryLabel::UnknownUnknown
        };
        state.set_label(id, label);
    }
    state
}

/// One problem to initialize.
#[derive(Debug, Clone)]
pub struct InitProblem {
    pub problem_id: String,
    pub problem: String,
}

/// Produces one initial knowledge state per problem.
pub struct KnowledgeStateInitializer {
    client: Arc<dyn LanguageModelClient>,
    max_tokens: u32,
}

impl KnowledgeStateInitializer {
    pub fn new(client: Arc<dyn LanguageModelClient>) -> Self {
        Self {
            client,
            max_tokens: 1200,
        }
    }

    pub async fn initialize(
        &self,
        strategy: &InitStrategy,
        problems: &[InitProblem],
        graph: &ConceptGraph,
    ) -> CoreResult<Vec<KnowledgeState>> {
        match strategy {
            InitStrategy::Sampling { profile, seed } => {
                info!(%profile, seed, problems = problems.len(), "Sampling initial knowledge states");
                Ok(sample_states(problems, graph, *profile, *seed))
            }
            InitStrategy::Llm(settings) => self.initialize_with_model(settings, problems, graph).await,
        }
    }

    async fn initialize_with_model(
        &self,
        settings: &LlmInitSettings,
        problems: &[InitProblem],
        graph: &ConceptGraph,
    ) -> CoreResult<Vec<KnowledgeState>> {
        let contexts = problems
            .iter()
            .map(|p| {
                let values = HashMap::from([
                    ("math_problem", p.problem.clone()),
                    (
                        "concept_list_with_prerequisites",
                        format_concept_list_with_prerequisites(graph.nodes(&p.problem_id)),
                    ),
                    ("education_level", settings.education_level.clone()),
                    ("indicators", settings.indicators.clone()),
                ]);
                let prompt = settings.template.render(&values)?;
                Ok(vec![
                    ChatMessage::system(LLM_INIT_SYSTEM_PROMPT),
                    ChatMessage::user(prompt),
                ])
            })
            .collect::<CoreResult<Vec<_>>>()?;

        info!(problems = contexts.len(), "Requesting model-diagnosed knowledge states");
        let responses = self
            .client
            .generate(
                contexts,
                GenerationParams::new(LLM_INIT_TEMPERATURE, self.max_tokens),
            )
            .await;

        Ok(problems
            .iter()
            .zip(responses)
            .map(|(problem, samples)| {
                let text = samples.first().map(String::as_str).unwrap_or_default();
                let state = KnowledgeState::from_model_response(text);
                if state.raw_response.is_some() {
                    warn!(problem_id = %problem.problem_id, "Initial state response was not a JSON object; keeping raw text");
                }
                state
            })
            .collect())
    }
}

/// Deterministic for a given seed: one generator is shared across problems
/// in order.
pub fn sample_states(
    problems: &[InitProblem],
    graph: &ConceptGraph,
    profile: ProficiencyProfile,
    seed: u64,
) -> Vec<KnowledgeState> {
    let mut rng = StdRng::seed_from_u64(seed);
    problems
        .iter()
        .map(|p| {
            let nodes = graph.nodes(&p.problem_id);
            let partition = sample_partition(nodes, profile, &mut rng);
            label_partition(nodes, &partition)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::MockLanguageModelClient;

    fn independent_nodes(n: usize) -> Vec<ConceptNode> {
        (0..n)
            .map(|i| ConceptNode::new(format!("C{}", i), ""))
            .collect()
    }

    fn chain(n: usize) -> Vec<ConceptNode> {
        (0..n)
            .map(|i| {
                let node = ConceptNode::new(format!("C{}", i), "");
                if i == 0 {
                    node
                } else {
                    let prev = format!("C{}", i - 1);
                    node.with_prerequisites(&[prev.as_str()])
                }
            })
            .collect()
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!(
            "Novice".parse::<ProficiencyProfile>().unwrap(),
            ProficiencyProfile::Novice
        );
        assert_eq!(
            "advanced".parse::<ProficiencyProfile>().unwrap(),
            ProficiencyProfile::Advanced
        );
        let err = "expert".parse::<ProficiencyProfile>().unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedProfile(p) if p == "expert"));
    }

    #[test]
    fn test_topological_order_respects_prerequisites() {
        let nodes = vec![
            ConceptNode::new("C", "").with_prerequisites(&["B"]),
            ConceptNode::new("B", "").with_prerequisites(&["A"]),
            ConceptNode::new("A", ""),
        ];
        let (order, cyclic) = topological_order(&nodes);
        assert_eq!(order, vec!["A", "B", "C"]);
        assert!(cyclic.is_empty());
    }

    #[test]
    fn test_topological_order_sets_cycles_aside() {
        let nodes = vec![
            ConceptNode::new("A", ""),
            ConceptNode::new("X", "").with_prerequisites(&["Y", "A"]),
            ConceptNode::new("Y", "").with_prerequisites(&["X"]),
        ];
        let (order, cyclic) = topological_order(&nodes);
        assert_eq!(order, vec!["A"]);
        assert_eq!(cyclic, vec!["X", "Y"]);
    }

    #[test]
    fn test_topological_order_skips_dependents_of_cycles() {
        let nodes = vec![
            ConceptNode::new("Z", "").with_prerequisites(&["X"]),
            ConceptNode::new("X", "").with_prerequisites(&["Y"]),
            ConceptNode::new("Y", "").with_prerequisites(&["X"]),
            ConceptNode::new("B", "").with_prerequisites(&["A"]),
            ConceptNode::new("A", ""),
        ];
        let (order, cyclic) = topological_order(&nodes);
        assert_eq!(order, vec!["A", "B"]);
        assert_eq!(cyclic, vec!["Z", "X", "Y"]);
    }

    #[test]
    fn test_targets_count_only_ordered_nodes() {
        // Ten free concepts next to a forty-concept ring.
        let mut nodes = independent_nodes(10);
        for i in 0..40 {
            let prev = format!("R{}", (i + 39) % 40);
            nodes.push(ConceptNode::new(format!("R{}", i), "").with_prerequisites(&[prev.as_str()]));
        }
        for seed in 0..30 {
            let mut rng = StdRng::seed_from_u64(seed);
            let partition = sample_partition(&nodes, ProficiencyProfile::Advanced, &mut rng);
            assert!(partition.known.len() <= 7, "seed {}", seed);
            assert!(partition.known.iter().all(|id| id.starts_with('C')));
            assert_eq!(
                partition.known.len() + partition.partially_known.len() + partition.unknown.len(),
                50
            );
        }
    }

    #[test]
    fn test_partition_covers_every_node_once() {
        let nodes = chain(30);
        let mut rng = StdRng::seed_from_u64(7);
        let partition = sample_partition(&nodes, ProficiencyProfile::Intermediate, &mut rng);
        let mut all: Vec<String> = partition
            .known
            .iter()
            .chain(&partition.partially_known)
            .chain(&partition.unknown)
            .cloned()
            .collect();
        all.sort();
        let mut expected: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_known_nodes_have_known_prerequisites() {
        let nodes = chain(40);
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let partition = sample_partition(&nodes, ProficiencyProfile::Advanced, &mut rng);
            let known: HashSet<&String> = partition.known.iter().collect();
            for node in nodes.iter().filter(|n| known.contains(&n.id)) {
                assert!(node.prerequisites.iter().all(|p| known.contains(p)));
            }
        }
    }

    #[test]
    fn test_novice_known_count_stays_within_profile() {
        let nodes = independent_nodes(100);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let partition = sample_partition(&nodes, ProficiencyProfile::Novice, &mut rng);
            assert!(partition.known.len() <= 10, "seed {}", seed);
        }
    }

    #[test]
    fn test_advanced_known_count_tracks_profile() {
        let nodes = independent_nodes(100);
        let mut total = 0usize;
        let runs = 50;
        for seed in 0..runs {
            let mut rng = StdRng::seed_from_u64(seed);
            let partition = sample_partition(&nodes, ProficiencyProfile::Advanced, &mut rng);
            assert!(partition.known.len() <= 70, "seed {}", seed);
            total += partition.known.len();
        }
        let mean = total as f64 / runs as f64;
        assert!((50.0..=70.0).contains(&mean), "mean known count {}", mean);
    }

    #[test]
    fn test_sampling_is_deterministic_for_a_seed() {
        let mut graph = ConceptGraph::new();
        graph.insert("0", chain(20));
        graph.insert("1", independent_nodes(15));
        let problems: Vec<InitProblem> = ["0", "1"]
            .iter()
            .map(|id| InitProblem {
                problem_id: id.to_string(),
                problem: String::new(),
            })
            .collect();

        let first = sample_states(&problems, &graph, ProficiencyProfile::Intermediate, 2);
        let second = sample_states(&problems, &graph, ProficiencyProfile::Intermediate, 2);
        assert_eq!(first, second);
        assert_eq!(first[0].len(), 20);
        assert_eq!(first[1].len(), 15);
    }

    #[test]
    fn test_label_partition_rules() {
        let nodes = vec![
            ConceptNode::new("K1", ""),
            ConceptNode::new("K2", ""),
            ConceptNode::new("U0", ""),
            ConceptNode::new("P_half", "").with_prerequisites(&["K1", "U0"]),
            ConceptNode::new("P_low", "").with_prerequisites(&["K1", "U0", "U1"]),
            ConceptNode::new("U1", "").with_prerequisites(&["K2"]),
            ConceptNode::new("U2", "").with_prerequisites(&["U0"]),
        ];
        let partition = Partition {
            known: vec!["K1".into(), "K2".into()],
            partially_known: vec!["P_half".into(), "P_low".into()],
            unknown: vec!["U0".into(), "U1".into(), "U2".into()],
        };
        let state = label_partition(&nodes, &partition);
        assert_eq!(state.label("K1"), MasteryLabel::KnowsWell);
        assert_eq!(state.label("P_half"), MasteryLabel::PartialUnderstanding);
        assert_eq!(state.label("P_low"), MasteryLabel::Struggling);
        assert_eq!(state.label("U1"), MasteryLabel::NotIntroduced);
        assert_eq!(state.label("U2"), MasteryLabel::UnknownUnknown);
        assert_eq!(state.get("U0").unwrap().state, Some(MasteryLabel::UnknownUnknown));
    }

    #[tokio::test]
    async fn test_model_initialization_with_raw_fallback() {
        let mut client = MockLanguageModelClient::new();
        client
            .expect_generate()
            .times(1)
            .returning(|batch, _| {
                assert_eq!(batch.len(), 2);
                assert!(batch[0][1].content.contains("- A: area (prerequisites: none listed)"));
                vec![
                    vec![r#"{"A": {"state": "struggling", "evidence": "guessing"}}"#.to_string()],
                    vec!["The student seems lost.".to_string()],
                ]
            });

        let mut graph = ConceptGraph::new();
        graph.insert("0", vec![ConceptNode::new("A", "area")]);
        graph.insert("1", vec![ConceptNode::new("B", "base")]);
        let strategy = InitStrategy::Llm(LlmInitSettings {
            template: PromptTemplate::new(
                "{math_problem}\n{concept_list_with_prerequisites}\n{education_level} {indicators}",
            ),
            education_level: "high school".to_string(),
            indicators: "none".to_string(),
        });
        let problems = vec![
            InitProblem {
                problem_id: "0".into(),
                problem: "Find the area.".into(),
            },
            InitProblem {
                problem_id: "1".into(),
                problem: "Find the base.".into(),
            },
        ];

        let states = KnowledgeStateInitializer::new(Arc::new(client))
            .initialize(&strategy, &problems, &graph)
            .await
            .unwrap();
        assert_eq!(states[0].label("A"), MasteryLabel::Struggling);
        assert_eq!(
            states[1].raw_response.as_deref(),
            Some("The student seems lost.")
        );
    }
}
