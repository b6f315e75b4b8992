//! End-to-end simulation run.
//!
//! Everything that can be rejected (unknown proficiency profile or length
//! mode, missing prompt templates or placeholders nobody fills, unreadable
//! input files) is checked in [`RunPlan::prepare`] before the first model
//! call.

use crate::cli::{Cli, InitMode};
use crate::config::Config;
use crate::loaders::{Problem, load_concepts, load_problems, load_profile_features};
use crate::output::{result_path, write_results};
use anyhow::Context;
use async_openai::config::OpenAIConfig;
use chrono::Utc;
use secrecy::ExposeSecret;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tutorsim_core::call_log::{CallLog, resolve_log_path};
use tutorsim_core::concept::{ConceptGraph, ExtractedConcept};
use tutorsim_core::dispatcher::{RateLimitedDispatcher, RetryPolicy};
use tutorsim_core::engine::{
    ConversationEngine, ConversationSeed, EngineConfig, KnowledgeTracking,
    student_prompt_placeholders,
};
use tutorsim_core::graph_builder::{
    ConceptGraphBuilder, IU_PROMPT_PLACEHOLDERS, IuExtractor, IuSource,
};
use tutorsim_core::initializer::{
    InitProblem, InitStrategy, KnowledgeStateInitializer, LLM_INIT_PLACEHOLDERS, LlmInitSettings,
};
use tutorsim_core::knowledge::KnowledgeState;
use tutorsim_core::length_control::{DEFAULT_LENGTH_TEXT, LengthControlMode, describe};
use tutorsim_core::llm_client::{LanguageModelClient, OpenAICompatibleBackend};
use tutorsim_core::profile::{InteractionFeature, filter_profile_features, format_interaction_profile};
use tutorsim_core::prompts::{PromptLibrary, PromptTemplate};
use tutorsim_core::rate_limit::RateLimiter;
use tutorsim_core::updater::{
    EXTRACT_PROMPT_PLACEHOLDERS, KnowledgeStateUpdater, UPDATE_PROMPT_PLACEHOLDERS,
};

/// Where the concept graph comes from.
pub enum GraphSource {
    /// Extract an information-unit graph from each problem and its solution.
    IuExtraction(PromptTemplate),
    /// Run the two-phase builder over pre-extracted concepts.
    Concepts(BTreeMap<String, Vec<ExtractedConcept>>),
}

/// Knowledge-tracking setup for a run.
pub struct TrackingPlan {
    pub strategy: InitStrategy,
    pub extract_template: PromptTemplate,
    pub update_template: PromptTemplate,
    pub graph_source: GraphSource,
}

/// A validated run, ready to execute.
pub struct RunPlan {
    pub problems: Vec<Problem>,
    pub initial_template: PromptTemplate,
    pub continuation_template: PromptTemplate,
    pub length_mode: Option<LengthControlMode>,
    pub features: Vec<InteractionFeature>,
    pub tracking: Option<TrackingPlan>,
}

/// Fetches a template and rejects it if it references a placeholder its
/// consumer never fills.
fn checked_template(
    prompts: &PromptLibrary,
    name: &str,
    available: &[&str],
) -> anyhow::Result<PromptTemplate> {
    let template = prompts.get(name)?;
    template
        .check_placeholders(available)
        .with_context(|| format!("Prompt template '{}' cannot be rendered", name))?;
    Ok(template)
}

impl RunPlan {
    pub fn prepare(cli: &Cli, prompts: &PromptLibrary) -> anyhow::Result<Self> {
        let length_mode = cli.length_mode().context("Invalid --length-control-setting")?;
        let profile = cli.proficiency().context("Invalid --knowledge-level")?;

        let initial_template = checked_template(
            prompts,
            &format!("{}-initial-query", cli.version),
            &student_prompt_placeholders(true, cli.length_control),
        )?;
        let continuation_template = checked_template(
            prompts,
            &cli.version,
            &student_prompt_placeholders(false, cli.length_control),
        )?;

        let strategy = match cli.init {
            InitMode::None => None,
            InitMode::Sampling => Some(InitStrategy::Sampling {
                profile,
                seed: cli.seed,
            }),
            InitMode::Llm => Some(InitStrategy::Llm(LlmInitSettings {
                template: checked_template(prompts, "dynamic-knowledge-init", &LLM_INIT_PLACEHOLDERS)?,
                education_level: cli.education_level.clone(),
                indicators: cli.indicators.clone(),
            })),
        };
        let tracking = match strategy {
            Some(strategy) => {
                let graph_source = match &cli.concepts {
                    Some(path) => GraphSource::Concepts(load_concepts(path)?),
                    None => GraphSource::IuExtraction(checked_template(
                        prompts,
                        "iu_graph_extraction",
                        &IU_PROMPT_PLACEHOLDERS,
                    )?),
                };
                Some(TrackingPlan {
                    strategy,
                    extract_template: checked_template(
                        prompts,
                        "dynamic-knowledge-extract",
                        &EXTRACT_PROMPT_PLACEHOLDERS,
                    )?,
                    update_template: checked_template(
                        prompts,
                        "dynamic-knowledge-update",
                        &UPDATE_PROMPT_PLACEHOLDERS,
                    )?,
                    graph_source,
                })
            }
            None => None,
        };

        let features = match &cli.profile_features {
            Some(path) => filter_profile_features(load_profile_features(path)?, &cli.features),
            None => Vec::new(),
        };
        let problems = load_problems(&cli.input, cli.num_conversations)?;

        Ok(Self {
            problems,
            initial_template,
            continuation_template,
            length_mode: cli.length_control.then_some(length_mode),
            features,
            tracking,
        })
    }

    /// One seed per problem, with its rendered profile and length constraint.
    pub fn seeds(&self, knowledge_states: Option<Vec<KnowledgeState>>) -> Vec<ConversationSeed> {
        let mut states = knowledge_states.map(Vec::into_iter);
        self.problems
            .iter()
            .map(|problem| {
                let length_control = self.length_mode.map(|mode| {
                    describe(&problem.row.user_queries, problem.row.problem_1_turns, mode)
                        .unwrap_or_else(|| DEFAULT_LENGTH_TEXT.to_string())
                });
                let length_text = length_control.as_deref().unwrap_or(DEFAULT_LENGTH_TEXT);
                ConversationSeed {
                    problem_id: problem.id.clone(),
                    problem: problem.row.problem.clone(),
                    user_profile: format_interaction_profile(&self.features, length_text),
                    length_control,
                    knowledge_state: states.as_mut().and_then(|it| it.next()),
                }
            })
            .collect()
    }
}

/// One dispatcher per model, all sharing the process-wide limiter and log.
pub struct ModelClients {
    pub student: Arc<dyn LanguageModelClient>,
    pub tutor: Arc<dyn LanguageModelClient>,
    pub extractor: Arc<dyn LanguageModelClient>,
}

impl ModelClients {
    pub fn new(config: &Config, cli: &Cli, call_log: Option<Arc<CallLog>>) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.openai_api_key.expose_secret())
            .with_api_base(&config.openai_base_url);
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_per_minute,
            Duration::from_secs(60),
        ));
        let retry = RetryPolicy {
            max_attempts: config.max_attempts,
            ..Default::default()
        };
        let dispatcher = |model: &str| -> Arc<dyn LanguageModelClient> {
            let backend = OpenAICompatibleBackend::new(openai_config.clone(), model.to_string());
            Arc::new(
                RateLimitedDispatcher::new(Arc::new(backend), limiter.clone())
                    .with_max_workers(config.max_workers)
                    .with_retry(retry)
                    .with_call_log(call_log.clone()),
            )
        };
        Self {
            student: dispatcher(&cli.user_model),
            tutor: dispatcher(cli.assistant_model()),
            extractor: dispatcher(&cli.iu_model),
        }
    }
}

async fn build_graph(
    source: GraphSource,
    problems: &[Problem],
    client: Arc<dyn LanguageModelClient>,
) -> anyhow::Result<ConceptGraph> {
    match source {
        GraphSource::Concepts(extracted) => {
            info!(problems = extracted.len(), "Building concept graph from extracted concepts");
            Ok(ConceptGraphBuilder::new(client).build(&extracted).await)
        }
        GraphSource::IuExtraction(template) => {
            info!(problems = problems.len(), "Extracting IU graphs");
            let sources: Vec<IuSource> = problems
                .iter()
                .map(|p| IuSource {
                    problem_id: p.id.clone(),
                    question: p.row.problem.clone(),
                    answer: p.row.solution.clone(),
                })
                .collect();
            let iu_graphs = IuExtractor::new(client, template)
                .extract_batch(&sources)
                .await
                .context("Failed to render the IU extraction prompt")?;
            Ok(ConceptGraph::from_iu_graphs(&iu_graphs).0)
        }
    }
}

/// Runs a whole simulation and returns the path of the written result file.
pub async fn run(config: &Config, cli: &Cli) -> anyhow::Result<PathBuf> {
    let prompts = PromptLibrary::load(&config.prompts_path).with_context(|| {
        format!("Failed to load prompts from {}", config.prompts_path.display())
    })?;
    let mut plan = RunPlan::prepare(cli, &prompts)?;
    info!(
        problems = plan.problems.len(),
        init = ?cli.init,
        version = %cli.version,
        "Simulation plan ready"
    );

    let call_log = if config.log_llm_calls {
        let path = resolve_log_path(&config.llm_log_path, Utc::now());
        let log = CallLog::open(&path, config.print_llm_calls)
            .await
            .with_context(|| format!("Failed to open call log {}", path.display()))?;
        info!(path = %log.path().display(), "Logging model calls");
        Some(Arc::new(log))
    } else {
        None
    };
    let clients = ModelClients::new(config, cli, call_log.clone());

    let mut engine = ConversationEngine::new(
        clients.student.clone(),
        clients.tutor.clone(),
        plan.initial_template.clone(),
        plan.continuation_template.clone(),
    )
    .with_config(EngineConfig {
        max_turns: cli.max_turns,
        ..Default::default()
    });

    let mut knowledge_states = None;
    if let Some(tracking) = plan.tracking.take() {
        let graph = Arc::new(
            build_graph(tracking.graph_source, &plan.problems, clients.extractor.clone()).await?,
        );

        let init_problems: Vec<InitProblem> = plan
            .problems
            .iter()
            .map(|p| InitProblem {
                problem_id: p.id.clone(),
                problem: p.row.problem.clone(),
            })
            .collect();
        knowledge_states = Some(
            KnowledgeStateInitializer::new(clients.student.clone())
                .initialize(&tracking.strategy, &init_problems, &graph)
                .await
                .context("Failed to initialize knowledge states")?,
        );

        // Updates are judged by the student-side model.
        engine = engine.with_knowledge_tracking(Some(KnowledgeTracking {
            updater: KnowledgeStateUpdater::new(
                clients.student.clone(),
                tracking.extract_template,
                tracking.update_template,
            ),
            graph,
        }));
    }

    let states = engine
        .run(plan.seeds(knowledge_states))
        .await
        .context("Conversation batch failed")?;
    let records: Vec<_> = states.iter().map(|s| s.to_record()).collect();

    let path = result_path(&cli.output_dir, cli.assistant_model(), &cli.version, Utc::now());
    write_results(&path, &records)?;
    info!(path = %path.display(), conversations = records.len(), "Saved results");

    if let Some(log) = call_log {
        log.close().await.context("Failed to close call log")?;
    }
    Ok(path)
}
