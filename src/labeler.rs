//! Zero-shot trait labeling of stored personas.
//!
//! A persona gets `custom_tags[trait] = true/false` once the classifier answers
//! Yes or No. "Unknown" (or a failed call) leaves the tag absent, so a later pass
//! asks again. A persona that already carries the tag is never re-classified.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::EngineSettings;
use crate::gateway::{complete, Attribution, ChatGateway, ChatRequest};
use crate::model::Persona;
use crate::prompts::classifier_messages;
use crate::store::{StoreError, SurveyStore};

#[derive(Debug, thiserror::Error)]
pub enum LabelerError {
    #[error("trait name is empty")]
    EmptyTrait,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraitVerdict {
    Yes,
    No,
    Unknown,
}

impl TraitVerdict {
    /// Reads the first word of a classifier reply. Anything other than a clear
    /// yes or no is `Unknown`.
    pub fn parse(reply: &str) -> Self {
        let first = reply
            .split(|c: char| !c.is_alphabetic())
            .find(|w| !w.is_empty())
            .map(str::to_lowercase);
        match first.as_deref() {
            Some("yes") => Self::Yes,
            Some("no") => Self::No,
            _ => Self::Unknown,
        }
    }

    /// The tag to store, if any.
    pub fn as_tag(self) -> Option<bool> {
        match self {
            Self::Yes => Some(true),
            Self::No => Some(false),
            Self::Unknown => None,
        }
    }
}

/// Counts from one labeling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelReport {
    /// Personas sent to the classifier.
    pub classified: usize,
    /// Personas that received a tag.
    pub updated: usize,
}

pub struct TraitLabeler {
    gateway: Arc<dyn ChatGateway>,
    model: String,
    char_budget: usize,
}

impl TraitLabeler {
    pub fn new(gateway: Arc<dyn ChatGateway>, settings: &EngineSettings) -> Self {
        Self {
            gateway,
            model: settings.classifier_model.clone(),
            char_budget: settings.labeler_char_budget,
        }
    }

    pub async fn classify(&self, persona: &Persona, trait_name: &str) -> TraitVerdict {
        let req = ChatRequest::new(
            self.model.clone(),
            classifier_messages(&persona.content, trait_name, self.char_budget),
            Attribution::new("labeler::classify").with_persona(persona.id),
        )
        .temperature(0.0)
        .max_tokens(5);

        let reply = complete(self.gateway.as_ref(), req).await;
        if reply.failed {
            return TraitVerdict::Unknown;
        }
        TraitVerdict::parse(&reply.content)
    }

    /// Label every stored persona lacking `trait_name`, writing each tag as it
    /// is decided.
    pub async fn label(
        &self,
        store: &dyn SurveyStore,
        trait_name: &str,
    ) -> Result<LabelReport, LabelerError> {
        let trait_name = trait_name.trim();
        if trait_name.is_empty() {
            return Err(LabelerError::EmptyTrait);
        }

        let personas = store.list_personas().await?;
        let mut report = LabelReport::default();
        for persona in personas {
            if persona.custom_tags.contains_key(trait_name) {
                continue;
            }
            report.classified += 1;

            let verdict = self.classify(&persona, trait_name).await;
            let Some(tag) = verdict.as_tag() else {
                debug!(persona_id = persona.id, trait_name, "trait undetermined");
                continue;
            };

            store
                .set_persona_tag(persona.id, trait_name, Value::Bool(tag))
                .await?;
            report.updated += 1;
        }

        info!(
            trait_name,
            classified = report.classified,
            updated = report.updated,
            "trait labeling finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_word_only() {
        assert_eq!(TraitVerdict::parse("Yes."), TraitVerdict::Yes);
        assert_eq!(TraitVerdict::parse("  no, they do not"), TraitVerdict::No);
        assert_eq!(TraitVerdict::parse("NO"), TraitVerdict::No);
        assert_eq!(TraitVerdict::parse("Unknown"), TraitVerdict::Unknown);
        assert_eq!(TraitVerdict::parse("unknown - not enough"), TraitVerdict::Unknown);
        assert_eq!(TraitVerdict::parse("Nobody knows"), TraitVerdict::Unknown);
        assert_eq!(TraitVerdict::parse(""), TraitVerdict::Unknown);
    }

    #[test]
    fn only_definite_verdicts_become_tags() {
        assert_eq!(TraitVerdict::Yes.as_tag(), Some(true));
        assert_eq!(TraitVerdict::No.as_tag(), Some(false));
        assert_eq!(TraitVerdict::Unknown.as_tag(), None);
    }
}
