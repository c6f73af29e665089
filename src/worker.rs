//! Job intake: one JSON job per line, dispatched to the executor, generator, or
//! labeler.
//!
//! ```text
//! {"job_type": "RUN_SURVEY", "run_id": 7}
//! {"job_type": "GENERATE_BACKSTORY", "count": 5, "model_name": "gpt-4-turbo"}
//! {"job_type": "LABEL_TRAIT", "trait": "owns a dog"}
//! ```
//!
//! Settings are reloaded from the store for every job.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::executor::{RunExecutor, RunOutcome};
use crate::gateway::ChatGateway;
use crate::generator::{GeneratorError, PersonaGenerator};
use crate::labeler::{LabelReport, LabelerError, TraitLabeler};
use crate::store::SurveyStore;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "job_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Job {
    RunSurvey {
        run_id: i64,
    },
    GenerateBackstory {
        #[serde(default = "default_count")]
        count: usize,
        #[serde(default)]
        model_name: Option<String>,
    },
    LabelTrait {
        #[serde(rename = "trait")]
        trait_name: String,
    },
}

fn default_count() -> usize {
    1
}

impl Job {
    pub fn parse(line: &str) -> Result<Self, JobError> {
        serde_json::from_str(line).map_err(JobError::Parse)
    }

    fn kind(&self) -> &'static str {
        match self {
            Job::RunSurvey { .. } => "RUN_SURVEY",
            Job::GenerateBackstory { .. } => "GENERATE_BACKSTORY",
            Job::LabelTrait { .. } => "LABEL_TRAIT",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("malformed job: {0}")]
    Parse(#[source] serde_json::Error),
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error(transparent)]
    Labeler(#[from] LabelerError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobReport {
    Run(RunOutcome),
    Generated { persona_ids: Vec<i64> },
    Labeled { classified: usize, updated: usize },
}

/// Counts from draining a job stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: usize,
    pub malformed: usize,
    pub failed: usize,
}

pub struct Worker {
    store: Arc<dyn SurveyStore>,
    gateway: Arc<dyn ChatGateway>,
}

impl Worker {
    pub fn new(store: Arc<dyn SurveyStore>, gateway: Arc<dyn ChatGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn handle(&self, job: Job) -> Result<JobReport, JobError> {
        let settings = EngineSettings::load(self.store.as_ref()).await;
        match job {
            Job::RunSurvey { run_id } => {
                let executor =
                    RunExecutor::new(Arc::clone(&self.store), Arc::clone(&self.gateway), settings);
                Ok(JobReport::Run(executor.execute(run_id).await))
            }
            Job::GenerateBackstory { count, model_name } => {
                let mut generator = PersonaGenerator::new(Arc::clone(&self.gateway), &settings);
                if let Some(model) = model_name {
                    generator = generator.with_model(model);
                }
                let mut rng = StdRng::from_entropy();
                let persona_ids = generator
                    .generate_batch(self.store.as_ref(), count, &settings.seed_pool, &mut rng)
                    .await?;
                Ok(JobReport::Generated { persona_ids })
            }
            Job::LabelTrait { trait_name } => {
                let labeler = TraitLabeler::new(Arc::clone(&self.gateway), &settings);
                let LabelReport {
                    classified,
                    updated,
                } = labeler.label(self.store.as_ref(), &trait_name).await?;
                Ok(JobReport::Labeled {
                    classified,
                    updated,
                })
            }
        }
    }

    /// Process jobs line by line until EOF. Blank lines are ignored; malformed
    /// lines and failed jobs are logged and skipped.
    pub async fn run_lines<R>(&self, reader: R) -> std::io::Result<WorkerStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut stats = WorkerStats::default();
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let job = match Job::parse(line) {
                Ok(job) => job,
                Err(e) => {
                    warn!(error = %e, "skipping malformed job");
                    stats.malformed += 1;
                    continue;
                }
            };

            let job_id = Uuid::new_v4();
            let span = info_span!("job", %job_id, kind = job.kind());
            match self.handle(job).instrument(span).await {
                Ok(report) => {
                    info!(%job_id, report = ?report, "job finished");
                    if matches!(&report, JobReport::Run(outcome) if !outcome.is_completed()) {
                        stats.failed += 1;
                    }
                }
                Err(e) => {
                    error!(%job_id, error = %e, "job failed");
                    stats.failed += 1;
                }
            }
            stats.processed += 1;
        }
        Ok(stats)
    }
}
