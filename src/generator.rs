//! Persona generation by critique-gated interview.
//!
//! Each question's answer is generated in the context of every answer kept so
//! far, then checked by a critic model. A rejected answer is regenerated, up to
//! `max_attempts` tries in total; after that the last candidate is kept so the
//! interview always finishes.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{CriticFailurePolicy, CriticSettings, EngineSettings};
use crate::demographics::DemographicProfile;
use crate::gateway::{complete, Attribution, ChatGateway, ChatRequest, TokenUsage};
use crate::model::NewPersona;
use crate::prompts::{critic_messages, interview_messages, render_transcript, QaPair};
use crate::store::{StoreError, SurveyStore};

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("seed pool is empty")]
    EmptySeedPool,
    #[error("interview has no questions")]
    NoQuestions,
    #[error("store failed after {inserted} personas were saved: {source}")]
    Store {
        inserted: usize,
        #[source]
        source: StoreError,
    },
}

/// What the critic said about a candidate answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticVerdict {
    Accept,
    Reject,
    /// The critic call failed.
    Unavailable,
}

/// One answered question and how it got there.
#[derive(Debug, Clone, PartialEq)]
pub struct InterviewTurn {
    pub qa: QaPair,
    pub attempts: u32,
    /// False when the answer was kept only because attempts ran out.
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interview {
    pub seed: String,
    pub turns: Vec<InterviewTurn>,
    /// Generation and critic tokens together.
    pub usage: TokenUsage,
}

impl Interview {
    pub fn transcript(&self) -> String {
        let pairs: Vec<QaPair> = self.turns.iter().map(|t| t.qa.clone()).collect();
        render_transcript(&pairs)
    }
}

pub struct PersonaGenerator {
    gateway: Arc<dyn ChatGateway>,
    questions: Vec<String>,
    model: String,
    critic: CriticSettings,
}

impl PersonaGenerator {
    pub fn new(gateway: Arc<dyn ChatGateway>, settings: &EngineSettings) -> Self {
        Self {
            gateway,
            questions: settings.interview_questions.clone(),
            model: settings.default_model.clone(),
            critic: settings.critic.clone(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask the critic about `candidate`. Never errors; a failed call is
    /// [`CriticVerdict::Unavailable`].
    pub async fn critique(
        &self,
        history: &[QaPair],
        question: &str,
        candidate: &str,
        usage: &mut TokenUsage,
    ) -> CriticVerdict {
        let req = ChatRequest::new(
            self.critic.model.clone(),
            critic_messages(history, question, candidate),
            Attribution::new("generator::critic"),
        )
        .temperature(0.0)
        .max_tokens(10);

        match self.gateway.chat(req).await {
            Ok(resp) => {
                *usage += resp.usage;
                if resp
                    .content
                    .to_uppercase()
                    .contains(&self.critic.accept_token.to_uppercase())
                {
                    CriticVerdict::Accept
                } else {
                    CriticVerdict::Reject
                }
            }
            Err(err) => {
                warn!(error = %err, "critic call failed");
                CriticVerdict::Unavailable
            }
        }
    }

    /// Run the full interview for one seed.
    pub async fn interview(&self, seed: &str) -> Interview {
        let max_attempts = self.critic.max_attempts.max(1);
        let mut usage = TokenUsage::default();
        let mut turns: Vec<InterviewTurn> = Vec::with_capacity(self.questions.len());
        let mut history: Vec<QaPair> = Vec::with_capacity(self.questions.len());

        for (index, question) in self.questions.iter().enumerate() {
            let mut attempts = 0;
            let (answer, accepted) = loop {
                attempts += 1;
                let req = ChatRequest::new(
                    self.model.clone(),
                    interview_messages(&history, question, seed),
                    Attribution::new("generator::interview"),
                );
                let candidate = complete(self.gateway.as_ref(), req).await;
                usage += candidate.usage;

                // Empty output and error annotations never go to the critic.
                let verdict = if candidate.failed || candidate.content.trim().is_empty() {
                    CriticVerdict::Reject
                } else {
                    self.critique(&history, question, &candidate.content, &mut usage)
                        .await
                };

                match (verdict, self.critic.on_error) {
                    (CriticVerdict::Accept, _)
                    | (CriticVerdict::Unavailable, CriticFailurePolicy::FailOpen) => {
                        break (candidate.content, true)
                    }
                    _ => {}
                }

                if attempts >= max_attempts {
                    warn!(
                        question = index,
                        attempts, "critic never accepted; keeping last candidate"
                    );
                    break (candidate.content, false);
                }
                debug!(question = index, attempt = attempts, ?verdict, "regenerating answer");
            };

            let qa = QaPair {
                question: question.clone(),
                answer,
            };
            history.push(qa.clone());
            turns.push(InterviewTurn {
                qa,
                attempts,
                accepted,
            });
        }

        Interview {
            seed: seed.to_string(),
            turns,
            usage,
        }
    }

    /// The transcript for one seed.
    pub async fn generate(&self, seed: &str) -> String {
        self.interview(seed).await.transcript()
    }

    /// Generate `count` personas from seeds drawn at random from `seed_pool`,
    /// saving each as soon as its interview finishes.
    ///
    /// Returns the new persona ids. A store failure stops the batch; personas
    /// already saved stay saved.
    pub async fn generate_batch<R: Rng + ?Sized>(
        &self,
        store: &dyn SurveyStore,
        count: usize,
        seed_pool: &[String],
        rng: &mut R,
    ) -> Result<Vec<i64>, GeneratorError> {
        if self.questions.is_empty() {
            return Err(GeneratorError::NoQuestions);
        }
        let seeds: Vec<String> = (0..count)
            .map(|_| seed_pool.choose(rng).cloned())
            .collect::<Option<_>>()
            .ok_or(GeneratorError::EmptySeedPool)?;

        let mut ids = Vec::with_capacity(count);
        for (i, seed) in seeds.into_iter().enumerate() {
            info!(index = i + 1, count, model = %self.model, "generating persona");
            let interview = self.interview(&seed).await;

            let mut tags = Map::new();
            tags.insert("seed".into(), Value::String(seed));
            let persona = NewPersona {
                content: interview.transcript(),
                model_signature: self.model.clone(),
                demographics: DemographicProfile::new(),
                custom_tags: tags,
            };
            let id = store
                .insert_persona(persona)
                .await
                .map_err(|source| GeneratorError::Store {
                    inserted: ids.len(),
                    source,
                })?;
            info!(persona_id = id, tokens = interview.usage.total_tokens, "persona saved");
            ids.push(id);
        }
        Ok(ids)
    }
}
