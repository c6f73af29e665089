//! Records the engine reads and writes: surveys, probes, personas, runs, results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::demographics::DemographicProfile;

/// Run lifecycle. `Queued` is set externally; `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Matching,
    Inference,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Matching => "MATCHING",
            Self::Inference => "INFERENCE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "MATCHING" => Some(Self::Matching),
            "INFERENCE" => Some(Self::Inference),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the executor may move a run from `self` to `next`.
    ///
    /// Any non-terminal state may fail.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match (self, next) {
            (s, Self::Failed) => !s.is_terminal(),
            (Self::Queued, Self::Matching) => true,
            (Self::Matching, Self::Inference) => true,
            (Self::Inference, Self::Completed) => true,
            _ => false,
        }
    }
}

/// How a run produces its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Methodology {
    /// Tell the model the demographic attributes directly.
    DemographicForcing,
    /// Match personas to the target and answer in character.
    Alterity,
}

impl Methodology {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DemographicForcing => "DEMOGRAPHIC_FORCING",
            Self::Alterity => "ALTERITY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEMOGRAPHIC_FORCING" => Some(Self::DemographicForcing),
            "ALTERITY" => Some(Self::Alterity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Survey {
    pub id: i64,
    pub name: String,
}

/// A survey question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    pub id: i64,
    pub survey_id: i64,
    pub content: String,
    pub probe_type: String,
    pub options: Option<Value>,
}

/// A named set of demographic constraints used as a matching target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemographicConfig {
    pub id: i64,
    pub name: String,
    pub constraints: DemographicProfile,
}

/// A generated backstory. Content and demographics are fixed once stored;
/// only `custom_tags` grows, through trait labeling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: i64,
    pub content: String,
    pub model_signature: String,
    pub demographics: DemographicProfile,
    pub custom_tags: Map<String, Value>,
}

/// A persona not yet stored.
#[derive(Debug, Clone)]
pub struct NewPersona {
    pub content: String,
    pub model_signature: String,
    pub demographics: DemographicProfile,
    pub custom_tags: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveyRun {
    pub id: i64,
    pub survey_id: i64,
    pub config_id: Option<i64>,
    /// Raw methodology string; unknown values are representable so the executor can fail them.
    pub methodology: String,
    pub status: RunStatus,
    pub run_config: Map<String, Value>,
    pub tokens_used: i64,
    pub total_cost: f64,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl SurveyRun {
    pub fn methodology(&self) -> Option<Methodology> {
        Methodology::parse(&self.methodology)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.run_config.get(key).and_then(Value::as_str)
    }

    pub fn config_usize(&self, key: &str) -> Option<usize> {
        self.run_config
            .get(key)
            .and_then(Value::as_u64)
            .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
    }
}

/// One answer to one probe, optionally in a persona's voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: i64,
    pub run_id: i64,
    pub probe_id: i64,
    pub persona_id: Option<i64>,
    pub response: Value,
    pub usage_cost: f64,
}

impl ResultRecord {
    pub fn text(&self) -> Option<&str> {
        self.response.get("text").and_then(Value::as_str)
    }
}

/// A result buffered during execution, written only when the run commits.
#[derive(Debug, Clone, PartialEq)]
pub struct NewResult {
    pub probe_id: i64,
    pub persona_id: Option<i64>,
    pub text: String,
    pub usage_cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use RunStatus::*;
        assert!(Queued.can_transition_to(Matching));
        assert!(Matching.can_transition_to(Inference));
        assert!(Inference.can_transition_to(Completed));
        assert!(Matching.can_transition_to(Failed));
        assert!(Queued.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Matching));
        assert!(!Queued.can_transition_to(Completed));
    }

    #[test]
    fn status_strings_round_trip() {
        for s in ["QUEUED", "MATCHING", "INFERENCE", "COMPLETED", "FAILED"] {
            assert_eq!(RunStatus::parse(s).map(RunStatus::as_str), Some(s));
        }
        assert_eq!(RunStatus::parse("running"), None);
    }

    #[test]
    fn unknown_methodology_is_none() {
        assert_eq!(Methodology::parse("ALTERITY"), Some(Methodology::Alterity));
        assert_eq!(Methodology::parse("VIBES"), None);
    }
}
