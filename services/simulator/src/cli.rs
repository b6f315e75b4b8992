use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tutorsim_core::CoreResult;
use tutorsim_core::initializer::ProficiencyProfile;
use tutorsim_core::length_control::LengthControlMode;

/// How initial knowledge states are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InitMode {
    /// No knowledge tracking.
    None,
    /// Seeded sampling from the concept graph's topology.
    Sampling,
    /// Model-diagnosed from the concept list.
    Llm,
}

/// Simulates tutoring dialogues between a student model and a tutor model.
#[derive(Parser, Debug, Clone)]
#[command(name = "simulate", about = "Simulate math tutoring conversations")]
pub struct Cli {
    /// Name of the student prompt pair (`<version>` and `<version>-initial-query`).
    #[arg(long)]
    pub version: String,

    /// JSON problem set.
    #[arg(long, default_value = "data/competition_math/problems.json")]
    pub input: PathBuf,

    /// Number of problems to simulate; non-positive means all.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub num_conversations: i64,

    #[arg(long, default_value = "gpt-5-mini")]
    pub user_model: String,

    /// Defaults to the user model.
    #[arg(long)]
    pub assistant_model: Option<String>,

    /// Model used for concept extraction.
    #[arg(long, default_value = "gpt-4o-mini")]
    pub iu_model: String,

    /// Constrain student message length from reference queries.
    #[arg(long)]
    pub length_control: bool,

    /// `range` or `average`.
    #[arg(long, default_value = "range")]
    pub length_control_setting: String,

    #[arg(long, value_enum, default_value_t = InitMode::None)]
    pub init: InitMode,

    /// `novice`, `intermediate` or `advanced`.
    #[arg(long, default_value = "intermediate")]
    pub knowledge_level: String,

    #[arg(long, default_value_t = 2)]
    pub seed: u64,

    #[arg(long, default_value_t = 15)]
    pub max_turns: u32,

    /// Pre-extracted concepts; switches graph construction to the two-phase builder.
    #[arg(long)]
    pub concepts: Option<PathBuf>,

    /// Interaction features to include in every student profile.
    #[arg(long)]
    pub profile_features: Option<PathBuf>,

    /// Restrict profile features to these names.
    #[arg(long, value_delimiter = ',')]
    pub features: Vec<String>,

    /// Education level given to model-diagnosed initialization.
    #[arg(long, default_value = "high school")]
    pub education_level: String,

    /// Additional indicators given to model-diagnosed initialization.
    #[arg(long, default_value = "")]
    pub indicators: String,

    #[arg(long, default_value = "output/competition_math")]
    pub output_dir: PathBuf,
}

impl Cli {
    pub fn assistant_model(&self) -> &str {
        self.assistant_model.as_deref().unwrap_or(&self.user_model)
    }

    pub fn length_mode(&self) -> CoreResult<LengthControlMode> {
        self.length_control_setting.parse()
    }

    pub fn proficiency(&self) -> CoreResult<ProficiencyProfile> {
        self.knowledge_level.parse()
    }
}
