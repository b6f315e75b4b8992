//! Conversation Engine
//!
//! Drives a batch of simulated tutoring conversations in lock-step rounds.
//! Each round sends one batch of student prompts and one batch of tutor
//! contexts through the language-model clients, then advances every
//! conversation's knowledge state in two more batched calls. Per-conversation
//! state is only touched between those calls, from the single task running
//! [`ConversationEngine::run`].
//!
//! A conversation moves from `Active` to `Finished` (the student terminated,
//! produced a malformed reply, or the tutor went silent) or to `OverMax`
//! (the turn limit was reached). Both are terminal.

use crate::concept::ConceptGraph;
use crate::error::CoreResult;
use crate::knowledge::KnowledgeState;
use crate::llm_client::{ChatMessage, ChatRole, GenerationParams, LanguageModelClient};
use crate::prompts::PromptTemplate;
use crate::updater::{KnowledgeStateUpdater, TurnEvidence};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const TUTOR_SYSTEM_PROMPT: &str = "You are a skilled math tutor. Your goal is to help students understand and solve problems independently. Provide guidance based on their questions or mistakes. Ask questions to encourage their thinking and let students do most of the work themselves. Never give out the solution directly to students.";

pub const MISGUIDED_ATTEMPT_HINT: &str =
    "If you are stuck, attempt a misguided approach without naming the missing concept.";

/// Placeholders filled for every student prompt.
pub const STUDENT_PROMPT_PLACEHOLDERS: [&str; 8] = [
    "user_profile",
    "message_style",
    "math_problem",
    "conversation_history",
    "knowledge_state_formatted",
    "askable_concepts",
    "unknown_unknown_concepts",
    "assistant_message",
];
/// Filled only when the run constrains message length.
pub const LENGTH_CONTROL_PLACEHOLDER: &str = "length_control";
/// Filled only for continuation prompts.
pub const MISGUIDED_HINT_PLACEHOLDER: &str = "misguided_attempt_hint";

/// Every placeholder a student prompt of the given kind can use.
pub fn student_prompt_placeholders(initial: bool, length_control: bool) -> Vec<&'static str> {
    let mut names = STUDENT_PROMPT_PLACEHOLDERS.to_vec();
    if length_control {
        names.push(LENGTH_CONTROL_PLACEHOLDER);
    }
    if !initial {
        names.push(MISGUIDED_HINT_PLACEHOLDER);
    }
    names
}

const TERMINATE_SIGNAL: &str = "terminate: true";
const THOUGHT_MARKER: &str = "Thought:";
const UTTERANCE_MARKERS: [&str; 3] = ["Response:", "Query:", "Message:"];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub student_temperature: f32,
    pub tutor_temperature: f32,
    pub max_tokens: u32,
    pub max_turns: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            student_temperature: 0.7,
            tutor_temperature: 0.0,
            max_tokens: 3000,
            max_turns: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Finished,
    OverMax,
}

/// One entry of the dialogue transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: ChatRole,
    pub content: String,
}

/// What the student model's raw reply amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudentMessage {
    Terminate,
    Utterance(String),
    /// A reasoning-formatted reply without a usable utterance, or an empty one.
    Malformed,
}

/// Interprets a raw student reply.
///
/// `terminate: true` (trimmed, any case) ends the conversation. When the text
/// contains `Thought:`, the utterance is whatever follows the first
/// occurrence of `Response:`, `Query:` or `Message:`, tried in that order.
pub fn parse_student_message(raw: &str) -> StudentMessage {
    if raw.trim().to_lowercase() == TERMINATE_SIGNAL {
        return StudentMessage::Terminate;
    }
    let utterance = if raw.contains(THOUGHT_MARKER) {
        let Some(marker) = UTTERANCE_MARKERS.iter().find(|m| raw.contains(*m)) else {
            return StudentMessage::Malformed;
        };
        raw.split(marker).nth(1).unwrap_or_default().trim()
    } else {
        raw
    };
    if utterance.trim().is_empty() {
        StudentMessage::Malformed
    } else {
        StudentMessage::Utterance(utterance.to_string())
    }
}

/// Everything needed to start one conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationSeed {
    pub problem_id: String,
    pub problem: String,
    /// Rendered interaction profile.
    pub user_profile: String,
    pub length_control: Option<String>,
    pub knowledge_state: Option<KnowledgeState>,
}

/// Mutable record of one conversation.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub problem_id: String,
    pub problem: String,
    pub user_profile: String,
    pub length_control: Option<String>,
    pub transcript: Vec<Turn>,
    pub conversation_history: String,
    pub student_messages: Vec<ChatMessage>,
    pub tutor_messages: Vec<ChatMessage>,
    pub knowledge_state: Option<KnowledgeState>,
    pub knowledge_state_history: Vec<KnowledgeState>,
    pub explained_concepts_history: Vec<Vec<String>>,
    pub turns: u32,
    pub status: ConversationStatus,
    started: bool,
    last_utterance: String,
}

/// Serialized form of a finished conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub problem_id: String,
    pub problem: String,
    pub conversation: Vec<Turn>,
    pub conversation_history: String,
    pub turns: u32,
    pub finished: bool,
    pub over_max: bool,
    pub knowledge_state: Option<KnowledgeState>,
    pub knowledge_state_history: Vec<KnowledgeState>,
    pub explained_concepts_history: Vec<Vec<String>>,
}

impl ConversationState {
    pub fn new(seed: ConversationSeed) -> Self {
        let knowledge_state_history = seed.knowledge_state.iter().cloned().collect();
        Self {
            problem_id: seed.problem_id,
            problem: seed.problem,
            user_profile: seed.user_profile,
            length_control: seed.length_control,
            transcript: Vec::new(),
            conversation_history: String::new(),
            student_messages: Vec::new(),
            tutor_messages: vec![ChatMessage::system(TUTOR_SYSTEM_PROMPT)],
            knowledge_state: seed.knowledge_state,
            knowledge_state_history,
            explained_concepts_history: Vec::new(),
            turns: 0,
            status: ConversationStatus::Active,
            started: false,
            last_utterance: String::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ConversationStatus::Active
    }

    fn last_tutor_message(&self) -> String {
        self.tutor_messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    /// The last two knowledge snapshots are identical.
    fn is_stagnating(&self) -> bool {
        match self.knowledge_state_history.as_slice() {
            [.., previous, last] => previous == last,
            _ => false,
        }
    }

    /// Non-empty only when the student is stagnating while some concept is
    /// still an unknown unknown.
    pub fn misguided_attempt_hint(&self) -> &'static str {
        match &self.knowledge_state {
            Some(state)
                if !state.unknown_unknown_concepts().is_empty() && self.is_stagnating() =>
            {
                MISGUIDED_ATTEMPT_HINT
            }
            _ => "",
        }
    }

    fn student_prompt_values(&self, initial: bool) -> CoreResult<HashMap<&'static str, String>> {
        let (formatted, askable, unknown) = match &self.knowledge_state {
            Some(state) => (
                state.formatted(),
                state.askable_concepts(),
                state.unknown_unknown_concepts(),
            ),
            None => ("{}".to_string(), Vec::new(), Vec::new()),
        };
        let mut values = HashMap::from([
            ("user_profile", self.user_profile.clone()),
            ("message_style", self.user_profile.clone()),
            ("math_problem", self.problem.clone()),
            (
                "conversation_history",
                self.conversation_history.trim().to_string(),
            ),
            ("knowledge_state_formatted", formatted),
            ("askable_concepts", serde_json::to_string(&askable)?),
            ("unknown_unknown_concepts", serde_json::to_string(&unknown)?),
            ("assistant_message", self.last_tutor_message()),
        ]);
        if let Some(length) = &self.length_control {
            values.insert(LENGTH_CONTROL_PLACEHOLDER, length.clone());
        }
        if !initial {
            values.insert(
                MISGUIDED_HINT_PLACEHOLDER,
                self.misguided_attempt_hint().to_string(),
            );
        }
        Ok(values)
    }

    /// Applies the student's raw reply. Returns whether the tutor should answer.
    fn receive_student(&mut self, raw: String) -> bool {
        let message = parse_student_message(&raw);
        if message == StudentMessage::Terminate {
            self.status = ConversationStatus::Finished;
            return false;
        }
        if !raw.is_empty() {
            self.transcript.push(Turn {
                role: ChatRole::User,
                content: raw,
            });
        }
        let StudentMessage::Utterance(utterance) = message else {
            debug!(problem_id = %self.problem_id, "Student reply had no utterance; finishing");
            self.status = ConversationStatus::Finished;
            return false;
        };

        let content = if self.tutor_messages.len() == 1 {
            format!(
                "Here is the problem that you will tutor me on:\n{}\n\n{}",
                self.problem.trim(),
                utterance
            )
        } else {
            utterance.clone()
        };
        self.tutor_messages.push(ChatMessage::user(content));
        self.last_utterance = utterance;
        true
    }

    /// Applies the tutor's reply. Returns whether a reply was recorded.
    fn receive_tutor(&mut self, reply: String, max_turns: u32) -> bool {
        if reply.is_empty() {
            self.status = ConversationStatus::Finished;
            return false;
        }
        self.conversation_history.push_str(&format!(
            "- You: {}\n- AI Tutor: {}\n",
            self.last_utterance, reply
        ));
        self.transcript.push(Turn {
            role: ChatRole::Assistant,
            content: reply.clone(),
        });
        self.tutor_messages.push(ChatMessage::assistant(reply));
        self.turns += 1;
        if self.turns >= max_turns {
            self.status = ConversationStatus::OverMax;
        }
        true
    }

    pub fn to_record(&self) -> ConversationRecord {
        ConversationRecord {
            problem_id: self.problem_id.clone(),
            problem: self.problem.clone(),
            conversation: self.transcript.clone(),
            conversation_history: self.conversation_history.clone(),
            turns: self.turns,
            finished: self.status == ConversationStatus::Finished,
            over_max: self.status == ConversationStatus::OverMax,
            knowledge_state: self.knowledge_state.clone(),
            knowledge_state_history: self.knowledge_state_history.clone(),
            explained_concepts_history: self.explained_concepts_history.clone(),
        }
    }
}

/// Knowledge tracking attached to an engine.
pub struct KnowledgeTracking {
    pub updater: KnowledgeStateUpdater,
    pub graph: Arc<ConceptGraph>,
}

pub struct ConversationEngine {
    student: Arc<dyn LanguageModelClient>,
    tutor: Arc<dyn LanguageModelClient>,
    initial_template: PromptTemplate,
    continuation_template: PromptTemplate,
    tracking: Option<KnowledgeTracking>,
    config: EngineConfig,
}

impl ConversationEngine {
    pub fn new(
        student: Arc<dyn LanguageModelClient>,
        tutor: Arc<dyn LanguageModelClient>,
        initial_template: PromptTemplate,
        continuation_template: PromptTemplate,
    ) -> Self {
        Self {
            student,
            tutor,
            initial_template,
            continuation_template,
            tracking: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_knowledge_tracking(mut self, tracking: Option<KnowledgeTracking>) -> Self {
        self.tracking = tracking;
        self
    }

    /// Runs every conversation to a terminal state or the round limit.
    ///
    /// Errors are limited to prompt rendering, which is a caller error and
    /// surfaces before the offending batch is sent.
    pub async fn run(&self, seeds: Vec<ConversationSeed>) -> CoreResult<Vec<ConversationState>> {
        let mut states: Vec<ConversationState> =
            seeds.into_iter().map(ConversationState::new).collect();

        for round in 1..=self.config.max_turns {
            let active: Vec<usize> = (0..states.len()).filter(|&i| states[i].is_active()).collect();
            if active.is_empty() {
                break;
            }
            info!(round, active = active.len(), "Starting round");

            let speaking = self.student_turn(&mut states, &active).await?;
            if speaking.is_empty() {
                break;
            }
            let replied = self.tutor_turn(&mut states, &speaking).await;
            self.update_knowledge(&mut states, &replied).await?;
        }

        let finished = states
            .iter()
            .filter(|s| s.status == ConversationStatus::Finished)
            .count();
        let over_max = states
            .iter()
            .filter(|s| s.status == ConversationStatus::OverMax)
            .count();
        info!(
            conversations = states.len(),
            finished, over_max, "Conversation batch complete"
        );
        Ok(states)
    }

    async fn student_turn(
        &self,
        states: &mut [ConversationState],
        active: &[usize],
    ) -> CoreResult<Vec<usize>> {
        let mut contexts = Vec::with_capacity(active.len());
        for &i in active {
            let state = &mut states[i];
            let initial = !state.started;
            let template = if initial {
                &self.initial_template
            } else {
                &self.continuation_template
            };
            let prompt = template.render(&state.student_prompt_values(initial)?)?;
            state.student_messages = vec![ChatMessage::user(prompt)];
            state.started = true;
            contexts.push(state.student_messages.clone());
        }

        let replies = self
            .student
            .generate(
                contexts,
                GenerationParams::new(self.config.student_temperature, self.config.max_tokens),
            )
            .await;

        Ok(active
            .iter()
            .zip(replies)
            .filter_map(|(&i, samples)| {
                let raw = samples.into_iter().next().unwrap_or_default();
                states[i].receive_student(raw).then_some(i)
            })
            .collect())
    }

    async fn tutor_turn(&self, states: &mut [ConversationState], speaking: &[usize]) -> Vec<usize> {
        let contexts = speaking
            .iter()
            .map(|&i| states[i].tutor_messages.clone())
            .collect();
        let replies = self
            .tutor
            .generate(
                contexts,
                GenerationParams::new(self.config.tutor_temperature, self.config.max_tokens),
            )
            .await;

        let max_turns = self.config.max_turns;
        speaking
            .iter()
            .zip(replies)
            .filter_map(|(&i, samples)| {
                let reply = samples.into_iter().next().unwrap_or_default();
                states[i].receive_tutor(reply, max_turns).then_some(i)
            })
            .collect()
    }

    async fn update_knowledge(
        &self,
        states: &mut [ConversationState],
        replied: &[usize],
    ) -> CoreResult<()> {
        let Some(tracking) = &self.tracking else {
            return Ok(());
        };
        let tracked: Vec<usize> = replied
            .iter()
            .copied()
            .filter(|&i| {
                states[i].knowledge_state.is_some()
                    && !tracking.graph.nodes(&states[i].problem_id).is_empty()
            })
            .collect();
        if tracked.is_empty() {
            return Ok(());
        }

        let assistant_messages: Vec<String> =
            tracked.iter().map(|&i| states[i].last_tutor_message()).collect();
        let updates = {
            let turns: Vec<TurnEvidence<'_>> = tracked
                .iter()
                .zip(&assistant_messages)
                .filter_map(|(&i, assistant_message)| {
                    let state = &states[i];
                    Some(TurnEvidence {
                        problem_id: &state.problem_id,
                        assistant_message,
                        student_message: &state.last_utterance,
                        state: state.knowledge_state.as_ref()?,
                    })
                })
                .collect();
            tracking.updater.advance_batch(&turns, &tracking.graph).await?
        };

        for (&i, update) in tracked.iter().zip(updates) {
            let state = &mut states[i];
            state.explained_concepts_history.push(update.explained_concepts);
            state.knowledge_state_history.push(update.state.clone());
            state.knowledge_state = Some(update.state);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::ConceptNode;
    use crate::knowledge::MasteryLabel;
    use crate::llm_client::MockLanguageModelClient;
    use mockall::Sequence;

    fn seed(id: &str, problem: &str) -> ConversationSeed {
        ConversationSeed {
            problem_id: id.to_string(),
            problem: problem.to_string(),
            user_profile: "## Interaction Style".to_string(),
            ..Default::default()
        }
    }

    fn engine(
        student: MockLanguageModelClient,
        tutor: MockLanguageModelClient,
        max_turns: u32,
    ) -> ConversationEngine {
        ConversationEngine::new(
            Arc::new(student),
            Arc::new(tutor),
            PromptTemplate::new("Start on: {math_problem}"),
            PromptTemplate::new("{conversation_history}\n{misguided_attempt_hint}"),
        )
        .with_config(EngineConfig {
            max_turns,
            ..Default::default()
        })
    }

    fn replies(texts: &[&str]) -> Vec<Vec<String>> {
        texts.iter().map(|t| vec![t.to_string()]).collect()
    }

    #[test]
    fn test_parse_student_message_markers() {
        assert_eq!(parse_student_message("  Terminate: TRUE \n"), StudentMessage::Terminate);
        assert_eq!(
            parse_student_message("How do I start?"),
            StudentMessage::Utterance("How do I start?".to_string())
        );
        assert_eq!(
            parse_student_message("Thought: unsure\nQuery: what is x?\nResponse: is x 2?"),
            StudentMessage::Utterance("is x 2?".to_string())
        );
        assert_eq!(
            parse_student_message("Thought: a\nMessage: hi"),
            StudentMessage::Utterance("hi".to_string())
        );
        assert_eq!(
            parse_student_message("Thought: a\nResponse: first Response: second"),
            StudentMessage::Utterance("first".to_string())
        );
        assert_eq!(parse_student_message("Thought: no marker"), StudentMessage::Malformed);
        assert_eq!(parse_student_message("Thought: x Response:   "), StudentMessage::Malformed);
        assert_eq!(parse_student_message(""), StudentMessage::Malformed);
    }

    #[tokio::test]
    async fn test_terminate_finishes_without_tutor_turn() {
        let mut student = MockLanguageModelClient::new();
        student
            .expect_generate()
            .times(1)
            .returning(|batch, params| {
                assert_eq!(batch.len(), 2);
                assert_eq!(batch[0][0].content, "Start on: P0");
                approx::assert_relative_eq!(params.temperature, 0.7);
                replies(&["terminate: true", "Thought: hmm\nResponse: How do I start?"])
            });
        let mut tutor = MockLanguageModelClient::new();
        tutor.expect_generate().times(1).returning(|batch, _| {
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0][0].content, TUTOR_SYSTEM_PROMPT);
            assert_eq!(
                batch[0][1].content,
                "Here is the problem that you will tutor me on:\nP1\n\nHow do I start?"
            );
            replies(&["What do you know about factoring?"])
        });

        let states = engine(student, tutor, 1)
            .run(vec![seed("0", "P0"), seed("1", "  P1 ")])
            .await
            .unwrap();

        assert_eq!(states[0].status, ConversationStatus::Finished);
        assert!(states[0].transcript.is_empty());
        assert_eq!(states[0].turns, 0);

        assert_eq!(states[1].status, ConversationStatus::OverMax);
        assert_eq!(states[1].transcript.len(), 2);
        assert_eq!(states[1].transcript[0].role, ChatRole::User);
        assert!(states[1].transcript[0].content.starts_with("Thought:"));
        assert_eq!(
            states[1].conversation_history,
            "- You: How do I start?\n- AI Tutor: What do you know about factoring?\n"
        );
    }

    #[tokio::test]
    async fn test_single_round_limit_puts_every_conversation_over_max() {
        let mut student = MockLanguageModelClient::new();
        student
            .expect_generate()
            .times(1)
            .returning(|batch, _| vec![vec!["Where do I begin?".to_string()]; batch.len()]);
        let mut tutor = MockLanguageModelClient::new();
        tutor
            .expect_generate()
            .times(1)
            .returning(|batch, _| vec![vec!["Read the problem again.".to_string()]; batch.len()]);

        let states = engine(student, tutor, 1)
            .run(vec![seed("0", "a"), seed("1", "b"), seed("2", "c")])
            .await
            .unwrap();

        for state in &states {
            assert_eq!(state.status, ConversationStatus::OverMax);
            let record = state.to_record();
            assert!(record.over_max);
            assert!(!record.finished);
            assert_eq!(record.turns, 1);
        }
    }

    #[tokio::test]
    async fn test_malformed_and_silent_replies_finish() {
        let mut student = MockLanguageModelClient::new();
        student
            .expect_generate()
            .times(1)
            .returning(|_, _| replies(&["Thought: I am lost", "", "ok?"]).into_iter().chain([vec![]]).collect());
        let mut tutor = MockLanguageModelClient::new();
        tutor.expect_generate().times(1).returning(|batch, _| {
            assert_eq!(batch.len(), 1);
            vec![vec![String::new()]]
        });

        let states = engine(student, tutor, 5)
            .run(vec![seed("0", "a"), seed("1", "b"), seed("2", "c"), seed("3", "d")])
            .await
            .unwrap();

        assert!(states.iter().all(|s| s.status == ConversationStatus::Finished));
        assert_eq!(states[0].transcript.len(), 1);
        assert!(states[1].transcript.is_empty());
        assert_eq!(states[2].transcript.len(), 1);
        assert_eq!(states[2].turns, 0);
    }

    #[tokio::test]
    async fn test_continuation_rounds_use_history() {
        let mut student = MockLanguageModelClient::new();
        let mut seq = Sequence::new();
        student
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| replies(&["Is it 4?"]));
        student
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|batch, _| {
                assert_eq!(
                    batch[0][0].content,
                    "- You: Is it 4?\n- AI Tutor: Why 4?\n"
                );
                replies(&["terminate: true"])
            });
        let mut tutor = MockLanguageModelClient::new();
        tutor.expect_generate().times(1).returning(|_, _| replies(&["Why 4?"]));

        let states = engine(student, tutor, 3).run(vec![seed("0", "2+2")]).await.unwrap();
        assert_eq!(states[0].status, ConversationStatus::Finished);
        assert_eq!(states[0].turns, 1);
        assert_eq!(states[0].tutor_messages.len(), 3);
    }

    #[test]
    fn test_declared_placeholders_match_rendered_values() {
        for (initial, length) in [(true, None), (false, None), (true, Some("around 10 words"))] {
            let state = ConversationState::new(ConversationSeed {
                length_control: length.map(str::to_string),
                ..seed("0", "p")
            });
            let mut rendered: Vec<&str> = state
                .student_prompt_values(initial)
                .unwrap()
                .into_keys()
                .collect();
            let mut declared = student_prompt_placeholders(initial, length.is_some());
            rendered.sort();
            declared.sort();
            assert_eq!(rendered, declared);
        }
    }

    #[test]
    fn test_misguided_hint_requires_stagnation_and_unknown_unknowns() {
        let stuck = KnowledgeState::from_labels([("A", MasteryLabel::UnknownUnknown)]);
        let mut state = ConversationState::new(ConversationSeed {
            knowledge_state: Some(stuck.clone()),
            ..seed("0", "p")
        });
        assert_eq!(state.misguided_attempt_hint(), "");

        state.knowledge_state_history.push(stuck.clone());
        assert_eq!(state.misguided_attempt_hint(), MISGUIDED_ATTEMPT_HINT);

        let known = KnowledgeState::from_labels([("A", MasteryLabel::KnowsWell)]);
        state.knowledge_state = Some(known.clone());
        state.knowledge_state_history = vec![known.clone(), known];
        assert_eq!(state.misguided_attempt_hint(), "");
    }

    #[tokio::test]
    async fn test_knowledge_is_updated_after_each_tutor_reply() {
        let mut student = MockLanguageModelClient::new();
        student
            .expect_generate()
            .times(1)
            .returning(|batch, _| {
                assert!(batch[0][0].content.contains("Start on: area"));
                replies(&["What is B?"])
            });
        let mut tutor = MockLanguageModelClient::new();
        tutor
            .expect_generate()
            .times(1)
            .returning(|_, _| replies(&["B builds on A."]));

        let mut analyst = MockLanguageModelClient::new();
        let mut seq = Sequence::new();
        analyst
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|batch, _| {
                assert!(batch[0][1].content.starts_with("B builds on A."));
                replies(&[r#"{"explained_concepts": ["B"]}"#])
            });
        analyst
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|batch, _| {
                assert!(batch[0][1].content.ends_with("What is B?"));
                replies(&[r#"{"B": {"new_state": "knows_well", "evidence": "asked"}}"#])
            });

        let mut graph = ConceptGraph::new();
        graph.insert(
            "0",
            vec![
                ConceptNode::new("A", "a"),
                ConceptNode::new("B", "b").with_prerequisites(&["A"]),
            ],
        );
        let tracking = KnowledgeTracking {
            updater: KnowledgeStateUpdater::new(
                Arc::new(analyst),
                PromptTemplate::new("{assistant_message} {candidate_concepts}"),
                PromptTemplate::new("{extracted_concepts}\n{user_response_analysis}"),
            ),
            graph: Arc::new(graph),
        };
        let initial = KnowledgeState::from_labels([("A", MasteryLabel::NotIntroduced)]);

        let states = engine(student, tutor, 1)
            .with_knowledge_tracking(Some(tracking))
            .run(vec![ConversationSeed {
                knowledge_state: Some(initial.clone()),
                ..seed("0", "area")
            }])
            .await
            .unwrap();

        let state = &states[0];
        assert_eq!(state.status, ConversationStatus::OverMax);
        assert_eq!(state.knowledge_state_history.len(), 2);
        assert_eq!(state.knowledge_state_history[0], initial);
        assert_eq!(state.explained_concepts_history, vec![vec!["B".to_string()]]);
        let current = state.knowledge_state.as_ref().unwrap();
        assert_eq!(current.label("B"), MasteryLabel::Struggling);

        let record = serde_json::to_value(state.to_record()).unwrap();
        assert_eq!(record["knowledge_state"]["B"]["state"], "struggling");
        assert_eq!(record["conversation"][0]["role"], "user");
    }
}
