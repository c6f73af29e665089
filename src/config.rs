//! Engine settings: hardcoded defaults, overlaid by the store's
//! `configurations` and `feature_flags` tables.
//!
//! Settings are built explicitly and handed to the services that need them; there
//! is no process-wide instance.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::gateway::PricingTable;
use crate::matcher::MatchParams;
use crate::store::SurveyStore;

pub const PRICING_KEY: &str = "PRICING_MODEL";
pub const INTERVIEW_QUESTIONS_KEY: &str = "INTERVIEW_QUESTIONS";
pub const SEED_POOL_KEY: &str = "SEED_POOL";
pub const LOCAL_MODELS_KEY: &str = "LOCAL_MODELS";
/// Feature flag: when enabled, a critic failure counts as a rejection.
pub const CRITIC_FAIL_CLOSED_FLAG: &str = "critic_fail_closed";

/// What the generator does when the critic call itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticFailurePolicy {
    /// Accept the candidate answer as-is.
    FailOpen,
    /// Treat the failure as a rejection and retry.
    FailClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CriticSettings {
    pub model: String,
    /// Generation attempts per question, including the first.
    pub max_attempts: u32,
    /// Token whose presence in the critic's reply means "accept".
    pub accept_token: String,
    pub on_error: CriticFailurePolicy,
}

impl Default for CriticSettings {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".into(),
            max_attempts: 3,
            accept_token: "YES".into(),
            on_error: CriticFailurePolicy::FailOpen,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub pricing: PricingTable,
    pub interview_questions: Vec<String>,
    pub seed_pool: Vec<String>,
    /// Models served by the local backend.
    pub local_models: Vec<String>,
    /// Model used when a run or batch does not name one.
    pub default_model: String,
    pub critic: CriticSettings,
    pub classifier_model: String,
    /// Characters of persona content shown to the trait classifier.
    pub labeler_char_budget: usize,
    /// Personas an Alterity run answers with.
    pub max_alterity_personas: usize,
    pub matching: MatchParams,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pricing: PricingTable::default(),
            interview_questions: default_interview_questions(),
            seed_pool: default_seed_pool(),
            local_models: vec![
                "meta-llama/Meta-Llama-3-8B-Instruct".into(),
                "meta-llama/Meta-Llama-3-70B-Instruct".into(),
            ],
            default_model: "gpt-4-turbo".into(),
            critic: CriticSettings::default(),
            classifier_model: "gpt-3.5-turbo".into(),
            labeler_char_budget: 2000,
            max_alterity_personas: 5,
            matching: MatchParams::default(),
        }
    }
}

impl EngineSettings {
    /// Defaults overlaid with whatever the store holds. A missing key or a failed
    /// read keeps the default.
    pub async fn load(store: &dyn SurveyStore) -> Self {
        let mut settings = Self::default();

        if let Some(pricing) = read_config::<PricingTable>(store, PRICING_KEY).await {
            settings.pricing = pricing;
        }
        if let Some(questions) = read_config::<Vec<String>>(store, INTERVIEW_QUESTIONS_KEY).await {
            if questions.is_empty() {
                warn!("configured interview has no questions; keeping defaults");
            } else {
                settings.interview_questions = questions;
            }
        }
        if let Some(seeds) = read_config::<Vec<String>>(store, SEED_POOL_KEY).await {
            settings.seed_pool = seeds;
        }
        if let Some(models) = read_config::<Vec<String>>(store, LOCAL_MODELS_KEY).await {
            settings.local_models = models;
        }

        match store.get_feature_flag(CRITIC_FAIL_CLOSED_FLAG).await {
            Ok(Some(true)) => settings.critic.on_error = CriticFailurePolicy::FailClosed,
            Ok(Some(false)) | Ok(None) => {}
            Err(e) => warn!(flag = CRITIC_FAIL_CLOSED_FLAG, error = %e, "failed to read feature flag"),
        }

        settings
    }
}

async fn read_config<T: DeserializeOwned>(store: &dyn SurveyStore, key: &str) -> Option<T> {
    let value: Value = match store.get_configuration(key).await {
        Ok(Some(value)) => value,
        Ok(None) => return None,
        Err(e) => {
            warn!(key, error = %e, "failed to read configuration");
            return None;
        }
    };
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(key, error = %e, "ignoring malformed configuration value");
            None
        }
    }
}

/// Life-history interview, asked in order.
pub fn default_interview_questions() -> Vec<String> {
    [
        "To start, I would like to begin with a big question: tell me the story of your life. Start from the beginning–from your childhood, to education, to family and relationships, and to any major life events you may have had.",
        "Some people tell us that they’ve reached a crossroads at some points in their life where multiple paths were available, and their choice then made a significant difference in defining who they are. What about you? Was there a moment like that for you, and if so, could you tell me the whole story about that from start to finish?",
        "Tell me about anyone else in your life we haven’t discussed (like friends or romantic partners). Are there people outside of your family who are important to you?",
        "Now let’s talk about your current neighborhood. Tell me all about the neighborhood and area in which you are living now.",
        "Tell me about any recent changes to your daily routine.",
        "How would you describe your political views?",
        "How have you been thinking about race in the U.S. recently?",
        "For you, what makes it easy or hard to stay healthy?",
        "Some people are excited about medical vaccination, and others, not so much. How about you?",
        "Some people say they struggle with depression, anxiety, or something else like that. How about for you?",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

pub fn default_seed_pool() -> Vec<String> {
    [
        "A 30-year-old nurse from Ohio who votes Independent.",
        "A 55-year-old truck driver from Alabama, strictly Republican.",
        "A 22-year-old college student in California studying Art, very liberal.",
        "A 40-year-old software engineer in Seattle, libertarian leaning.",
        "A 65-year-old retiree in Florida, concerned about social security.",
        "A 28-year-old teacher in Chicago, active in unions.",
        "A 45-year-old small business owner in Texas.",
        "A 35-year-old stay-at-home parent in Utah.",
        "A 50-year-old factory worker in Michigan.",
        "A 25-year-old barista in Portland, Oregon.",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_full_interview() {
        let settings = EngineSettings::default();
        assert_eq!(settings.interview_questions.len(), 10);
        assert_eq!(settings.critic.max_attempts, 3);
        assert_eq!(settings.critic.on_error, CriticFailurePolicy::FailOpen);
        assert_eq!(settings.labeler_char_budget, 2000);
        assert_eq!(settings.max_alterity_personas, 5);
        assert_eq!(settings.default_model, "gpt-4-turbo");
    }
}
