//! Survey run execution.
//!
//! A run moves QUEUED → MATCHING → INFERENCE → COMPLETED, or to FAILED from any
//! non-terminal state. Each status change is written before the next phase
//! starts so observers can poll progress. Results are buffered and written in
//! the same transaction that marks the run COMPLETED; a failed run keeps none.
//!
//! [`RunExecutor::execute`] never returns an error and never panics on bad input:
//! every failure ends as a FAILED run (best effort) and a [`RunOutcome`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::assignment::AssignmentError;
use crate::config::EngineSettings;
use crate::demographics::{DemographicError, DemographicProfile};
use crate::gateway::{complete, Attribution, ChatGateway, ChatRequest, Message, TokenUsage};
use crate::matcher::WeightedMatcher;
use crate::model::{Methodology, NewResult, Persona, Probe, RunStatus, SurveyRun};
use crate::prompts::{forcing_system_prompt, in_character_system_prompt};
use crate::store::{RunTotals, StoreError, SurveyStore};

/// Run config keys.
pub const MODEL_NAME_KEY: &str = "model_name";
pub const PROMPT_TEMPLATE_KEY: &str = "prompt_template";
pub const POPULATION_SIZE_KEY: &str = "population_size";
pub const MAX_PERSONAS_KEY: &str = "max_personas";

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown methodology '{0}'")]
    UnknownMethodology(String),
    #[error("invalid demographic constraints: {0}")]
    InvalidConstraints(#[from] DemographicError),
    #[error("persona assignment failed: {0}")]
    Assignment(#[from] AssignmentError),
    #[error("illegal status transition {from:?} -> {to:?}")]
    IllegalTransition { from: RunStatus, to: RunStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunDisposition {
    Completed,
    Failed { reason: String },
    /// The run was not QUEUED when claimed; nothing was written.
    Skipped { status: RunStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: i64,
    #[serde(flatten)]
    pub disposition: RunDisposition,
    pub results_written: usize,
    pub usage: TokenUsage,
    pub total_cost: f64,
}

impl RunOutcome {
    fn failed(run_id: i64, reason: String) -> Self {
        Self {
            run_id,
            disposition: RunDisposition::Failed { reason },
            results_written: 0,
            usage: TokenUsage::default(),
            total_cost: 0.0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.disposition == RunDisposition::Completed
    }
}

/// Responses gathered during INFERENCE, not yet written.
#[derive(Debug, Default)]
struct InferenceBatch {
    results: Vec<NewResult>,
    usage: TokenUsage,
    total_cost: f64,
}

pub struct RunExecutor {
    store: Arc<dyn SurveyStore>,
    gateway: Arc<dyn ChatGateway>,
    settings: EngineSettings,
    matcher: WeightedMatcher,
}

impl RunExecutor {
    pub fn new(
        store: Arc<dyn SurveyStore>,
        gateway: Arc<dyn ChatGateway>,
        settings: EngineSettings,
    ) -> Self {
        let matcher = WeightedMatcher::new(settings.matching);
        Self {
            store,
            gateway,
            settings,
            matcher,
        }
    }

    pub async fn execute(&self, run_id: i64) -> RunOutcome {
        match self.try_execute(run_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(run_id, error = %err, "run failed");
                match self.store.fail_run(run_id).await {
                    Ok(true) => {}
                    Ok(false) => warn!(run_id, "run already finished; status left unchanged"),
                    Err(mark_err) => warn!(run_id, error = %mark_err, "could not mark run FAILED"),
                }
                RunOutcome::failed(run_id, err.to_string())
            }
        }
    }

    async fn try_execute(&self, run_id: i64) -> Result<RunOutcome, ExecutorError> {
        let run = self.store.get_run(run_id).await?;
        if !self.store.claim_run(run_id).await? {
            let current = self.store.get_run(run_id).await?.status;
            warn!(run_id, status = current.as_str(), "run is not QUEUED; skipping");
            return Ok(RunOutcome {
                run_id,
                disposition: RunDisposition::Skipped { status: current },
                results_written: 0,
                usage: TokenUsage::default(),
                total_cost: 0.0,
            });
        }
        let mut status = RunStatus::Matching;
        info!(run_id, methodology = %run.methodology, "run claimed");

        let methodology = run
            .methodology()
            .ok_or_else(|| ExecutorError::UnknownMethodology(run.methodology.clone()))?;

        let probes = self.store.list_probes(run.survey_id).await?;
        let target = self.load_target(&run).await?;
        let model = run
            .config_str(MODEL_NAME_KEY)
            .unwrap_or(self.settings.default_model.as_str())
            .to_string();

        let batch = match methodology {
            Methodology::DemographicForcing => {
                self.advance(run_id, &mut status, RunStatus::Inference)
                    .await?;
                self.run_forcing(&run, &probes, &target, &model).await
            }
            Methodology::Alterity => {
                let personas = self.store.list_personas().await?;
                let selected = self.select_personas(&run, &target, &personas)?;
                self.advance(run_id, &mut status, RunStatus::Inference)
                    .await?;
                self.run_alterity(&run, &probes, &selected, &model).await
            }
        };

        transition(status, RunStatus::Completed)?;
        let results_written = batch.results.len();
        let totals = RunTotals {
            tokens_used: i64::try_from(batch.usage.total_tokens).unwrap_or(i64::MAX),
            total_cost: batch.total_cost,
        };
        self.store
            .commit_run_results(run_id, batch.results, totals)
            .await?;

        info!(
            run_id,
            results = results_written,
            tokens = batch.usage.total_tokens,
            cost = batch.total_cost,
            "run completed"
        );
        Ok(RunOutcome {
            run_id,
            disposition: RunDisposition::Completed,
            results_written,
            usage: batch.usage,
            total_cost: batch.total_cost,
        })
    }

    async fn advance(
        &self,
        run_id: i64,
        status: &mut RunStatus,
        next: RunStatus,
    ) -> Result<(), ExecutorError> {
        transition(*status, next)?;
        self.store.update_run_status(run_id, next).await?;
        info!(run_id, from = status.as_str(), to = next.as_str(), "run status changed");
        *status = next;
        Ok(())
    }

    /// The run's demographic target; empty when the run has no config.
    async fn load_target(&self, run: &SurveyRun) -> Result<DemographicProfile, ExecutorError> {
        let Some(config_id) = run.config_id else {
            return Ok(DemographicProfile::new());
        };
        let config = self.store.get_demographic_config(config_id).await?;
        config.constraints.validate()?;
        Ok(config.constraints)
    }

    fn select_personas<'a>(
        &self,
        run: &SurveyRun,
        target: &DemographicProfile,
        personas: &'a [Persona],
    ) -> Result<Vec<&'a Persona>, ExecutorError> {
        let cap = run
            .config_usize(MAX_PERSONAS_KEY)
            .unwrap_or(self.settings.max_alterity_personas);
        let requested = run.config_usize(POPULATION_SIZE_KEY).unwrap_or(1).max(1);
        // Each target keeps at most one persona and only `cap` matches survive.
        let population = requested.min(cap).min(personas.len()).max(1);
        if population < requested {
            debug!(run_id = run.id, requested, population, "population size clamped");
        }
        let targets = vec![target.clone(); population];

        let matches = self.matcher.match_personas(&targets, personas)?;
        let selected: Vec<&Persona> = matches.iter().take(cap).map(|m| m.persona).collect();
        if selected.is_empty() {
            warn!(run_id = run.id, personas = personas.len(), "no personas matched");
        } else {
            info!(
                run_id = run.id,
                selected = selected.len(),
                candidates = personas.len(),
                "personas matched"
            );
        }
        Ok(selected)
    }

    /// One call per probe; the run's total cost is split evenly over its results.
    async fn run_forcing(
        &self,
        run: &SurveyRun,
        probes: &[Probe],
        target: &DemographicProfile,
        model: &str,
    ) -> InferenceBatch {
        let system = forcing_system_prompt(target, run.config_str(PROMPT_TEMPLATE_KEY));
        let mut batch = InferenceBatch::default();
        let mut answers = Vec::with_capacity(probes.len());

        for probe in probes {
            let req = ChatRequest::new(
                model,
                vec![Message::system(&system), Message::user(&probe.content)],
                Attribution::new("executor::forcing").with_run(run.id),
            );
            let reply = complete(self.gateway.as_ref(), req).await;
            batch.usage += reply.usage;
            answers.push((probe.id, reply.content));
        }

        batch.total_cost = self.settings.pricing.cost(&batch.usage, model);
        let per_result = if answers.is_empty() {
            0.0
        } else {
            batch.total_cost / answers.len() as f64
        };
        batch.results = answers
            .into_iter()
            .map(|(probe_id, text)| NewResult {
                probe_id,
                persona_id: None,
                text,
                usage_cost: per_result,
            })
            .collect();
        batch
    }

    /// One call per (persona, probe) pair, each result carrying its own cost.
    async fn run_alterity(
        &self,
        run: &SurveyRun,
        probes: &[Probe],
        personas: &[&Persona],
        model: &str,
    ) -> InferenceBatch {
        let mut batch = InferenceBatch::default();
        for persona in personas {
            let system = in_character_system_prompt(&persona.content);
            for probe in probes {
                let req = ChatRequest::new(
                    model,
                    vec![Message::system(&system), Message::user(&probe.content)],
                    Attribution::new("executor::alterity")
                        .with_run(run.id)
                        .with_persona(persona.id),
                );
                let reply = complete(self.gateway.as_ref(), req).await;
                let cost = self.settings.pricing.cost(&reply.usage, model);
                batch.usage += reply.usage;
                batch.total_cost += cost;
                batch.results.push(NewResult {
                    probe_id: probe.id,
                    persona_id: Some(persona.id),
                    text: reply.content,
                    usage_cost: cost,
                });
            }
        }
        batch
    }
}

fn transition(from: RunStatus, to: RunStatus) -> Result<(), ExecutorError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ExecutorError::IllegalTransition { from, to })
    }
}
