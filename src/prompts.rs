//! Prompt text for every chat call the engine makes.
//!
//! Rendering only; no I/O. Callers assemble these into [`Message`] lists.

use crate::demographics::DemographicProfile;
use crate::gateway::Message;

// =============================================================================
// Interview
// =============================================================================

pub const INTERVIEW_SYSTEM: &str = "You are participating in an interview. Answer the interviewer's questions naturally and consistently with your previous answers.";

/// A question and the answer kept for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

/// Messages for the next interview question: system framing (with the seed on
/// the first turn only), prior turns as alternating user/assistant messages, then
/// the question.
pub fn interview_messages(history: &[QaPair], question: &str, seed: &str) -> Vec<Message> {
    let system = if history.is_empty() {
        format!("{INTERVIEW_SYSTEM}\n\nPersona Seed: {seed}")
    } else {
        INTERVIEW_SYSTEM.to_string()
    };

    let mut messages = Vec::with_capacity(history.len() * 2 + 2);
    messages.push(Message::system(system));
    for turn in history {
        messages.push(Message::user(&turn.question));
        messages.push(Message::assistant(&turn.answer));
    }
    messages.push(Message::user(question));
    messages
}

/// `Interviewer:`/`Participant:` transcript; the persona's stored content.
pub fn render_transcript(turns: &[QaPair]) -> String {
    turns
        .iter()
        .map(|t| format!("Interviewer: {}\nParticipant: {}", t.question, t.answer))
        .collect::<Vec<_>>()
        .join("\n\n")
}

// =============================================================================
// Critic
// =============================================================================

pub const CRITIC_SYSTEM: &str = "You are a strict critic. Check the following interview response for:\n\
1. Internal consistency with previous answers (if any).\n\
2. Natural flow (no code, no repetitive phrases, no metadata).\n\
3. Relevance to the question.\n\
Respond with 'YES' if good, 'NO' if bad.";

pub fn critic_messages(history: &[QaPair], question: &str, candidate: &str) -> Vec<Message> {
    let context = history
        .iter()
        .map(|t| format!("Q: {}\nA: {}", t.question, t.answer))
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!(
        "Context:\n{context}\n\nQuestion:\n{question}\n\nResponse:\n{candidate}"
    );
    vec![Message::system(CRITIC_SYSTEM), Message::user(user)]
}

// =============================================================================
// Trait classifier
// =============================================================================

pub const CLASSIFIER_SYSTEM: &str = "You are a zero-shot classifier.";

/// First `budget` characters of `content`, cut on a char boundary.
pub fn truncate_chars(content: &str, budget: usize) -> &str {
    match content.char_indices().nth(budget) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}

pub fn classifier_messages(content: &str, trait_name: &str, budget: usize) -> Vec<Message> {
    let excerpt = truncate_chars(content, budget);
    let user = format!(
        "Does the author of this text explicitly or implicitly indicate that they '{trait_name}'? \
         Answer with exactly one word: Yes, No, or Unknown.\n\nText: {excerpt}..."
    );
    vec![Message::system(CLASSIFIER_SYSTEM), Message::user(user)]
}

// =============================================================================
// Survey answering
// =============================================================================

const FORCED_TRAITS: [&str; 3] = ["age", "gender", "political_party"];

/// System prompt that states a respondent's demographics outright.
///
/// Age, gender, and party fill the fixed sentence ("unknown" when absent). Any
/// other demographic traits follow in name order, then the run's optional
/// instruction text.
pub fn forcing_system_prompt(profile: &DemographicProfile, template: Option<&str>) -> String {
    let attr = |name: &str| {
        profile
            .get(name)
            .and_then(|v| v.modal_value())
            .unwrap_or_else(|| "unknown".to_string())
    };
    let mut prompt = format!(
        "You are a {} year old {} who identifies as a {}.",
        attr("age"),
        attr("gender"),
        attr("political_party")
    );

    let extra: Vec<String> = profile
        .demographic_traits()
        .filter(|(name, _)| !FORCED_TRAITS.contains(&name.as_str()))
        .filter_map(|(name, value)| value.modal_value().map(|v| format!("{name}: {v}")))
        .collect();
    if !extra.is_empty() {
        prompt.push_str(&format!(" Other attributes: {}.", extra.join("; ")));
    }

    if let Some(template) = template.map(str::trim).filter(|t| !t.is_empty()) {
        prompt.push_str("\n\n");
        prompt.push_str(template);
    }
    prompt
}

/// System prompt that puts the model in a persona's backstory.
pub fn in_character_system_prompt(backstory: &str) -> String {
    format!(
        "You are the person described in the following backstory. Answer the question as this \
         person would, maintaining their tone, memories, and opinions.\n\nBackstory: {backstory}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demographics::TraitValue;
    use crate::gateway::Role;

    fn qa(q: &str, a: &str) -> QaPair {
        QaPair {
            question: q.into(),
            answer: a.into(),
        }
    }

    #[test]
    fn seed_only_on_first_turn() {
        let first = interview_messages(&[], "Where did you grow up?", "A nurse from Ohio.");
        assert_eq!(first.len(), 2);
        assert!(first[0].content.ends_with("Persona Seed: A nurse from Ohio."));

        let later = interview_messages(
            &[qa("Where did you grow up?", "Dayton.")],
            "What do you do?",
            "A nurse from Ohio.",
        );
        assert_eq!(later.len(), 4);
        assert_eq!(later[0].content, INTERVIEW_SYSTEM);
        assert_eq!(later[1].role, Role::User);
        assert_eq!(later[2].role, Role::Assistant);
        assert_eq!(later[3].content, "What do you do?");
    }

    #[test]
    fn transcript_format() {
        let text = render_transcript(&[qa("Q1", "A1"), qa("Q2", "A2")]);
        assert_eq!(
            text,
            "Interviewer: Q1\nParticipant: A1\n\nInterviewer: Q2\nParticipant: A2"
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn forcing_prompt_fills_unknowns_and_extras() {
        let profile = DemographicProfile::new()
            .with("age", TraitValue::scalar(30.0))
            .with(
                "political_party",
                TraitValue::distribution([("Democrat", 0.7), ("Republican", 0.3)]),
            )
            .with("region", TraitValue::scalar("Ohio"));
        let prompt = forcing_system_prompt(&profile, Some("Answer in one sentence."));
        assert_eq!(
            prompt,
            "You are a 30 year old unknown who identifies as a Democrat. \
             Other attributes: region: Ohio.\n\nAnswer in one sentence."
        );
    }
}
