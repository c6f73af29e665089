mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;

use alterity_engine::config::{CriticFailurePolicy, EngineSettings};
use alterity_engine::gateway::{ChatResponse, ProviderError, Role, TokenUsage};
use alterity_engine::generator::{GeneratorError, PersonaGenerator};
use alterity_engine::SurveyStore;

use common::{temp_store, FailingStore, ScriptedGateway};

const INTERVIEW: &str = "generator::interview";
const CRITIC: &str = "generator::critic";

fn settings(policy: CriticFailurePolicy) -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.interview_questions = vec!["Where did you grow up?".into(), "What do you do?".into()];
    settings.critic.on_error = policy;
    settings
}

/// Interview calls answer "answer N"; critic calls answer with `critic`.
fn gateway_with_critic(
    critic: impl Fn() -> Result<String, ProviderError> + Send + Sync + 'static,
) -> Arc<ScriptedGateway> {
    let n = AtomicUsize::new(0);
    ScriptedGateway::new(move |req| {
        if req.attribution.caller == CRITIC {
            critic().map(|text| ChatResponse::new(text, TokenUsage::new(5, 1)))
        } else {
            let i = n.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse::new(format!("answer {i}"), TokenUsage::new(20, 10)))
        }
    })
}

#[tokio::test]
async fn accepted_answers_take_one_attempt() {
    let gateway = gateway_with_critic(|| Ok("YES".into()));
    let generator = PersonaGenerator::new(gateway.clone(), &settings(CriticFailurePolicy::FailOpen));

    let interview = generator.interview("A nurse from Ohio.").await;

    assert_eq!(interview.turns.len(), 2);
    assert!(interview.turns.iter().all(|t| t.attempts == 1 && t.accepted));
    assert_eq!(gateway.calls_from(INTERVIEW), 2);
    assert_eq!(gateway.calls_from(CRITIC), 2);
    assert_eq!(
        interview.transcript(),
        "Interviewer: Where did you grow up?\nParticipant: answer 0\n\n\
         Interviewer: What do you do?\nParticipant: answer 1"
    );
    assert_eq!(interview.usage, TokenUsage::new(2 * 20 + 2 * 5, 2 * 10 + 2));
}

#[tokio::test]
async fn persistent_rejection_stops_at_three_attempts() {
    let gateway = gateway_with_critic(|| Ok("NO".into()));
    let generator = PersonaGenerator::new(gateway.clone(), &settings(CriticFailurePolicy::FailOpen));

    let interview = generator.interview("A barista in Portland.").await;

    assert_eq!(gateway.calls_from(INTERVIEW), 6);
    assert_eq!(gateway.calls_from(CRITIC), 6);
    for turn in &interview.turns {
        assert_eq!(turn.attempts, 3);
        assert!(!turn.accepted);
        assert!(!turn.qa.answer.is_empty());
    }
    // The last candidate of each question is kept.
    assert_eq!(interview.turns[0].qa.answer, "answer 2");
    assert_eq!(interview.turns[1].qa.answer, "answer 5");
}

#[tokio::test]
async fn critic_error_fails_open_by_default() {
    let gateway = gateway_with_critic(|| Err(ProviderError::backend("test", "critic down", false)));
    let generator = PersonaGenerator::new(gateway.clone(), &settings(CriticFailurePolicy::FailOpen));

    let interview = generator.interview("A teacher in Chicago.").await;

    assert_eq!(gateway.calls_from(INTERVIEW), 2);
    assert!(interview.turns.iter().all(|t| t.attempts == 1 && t.accepted));
}

#[tokio::test]
async fn critic_error_fails_closed_when_configured() {
    let gateway = gateway_with_critic(|| Err(ProviderError::backend("test", "critic down", false)));
    let generator =
        PersonaGenerator::new(gateway.clone(), &settings(CriticFailurePolicy::FailClosed));

    let interview = generator.interview("A teacher in Chicago.").await;

    assert_eq!(gateway.calls_from(INTERVIEW), 6);
    assert!(interview.turns.iter().all(|t| t.attempts == 3 && !t.accepted));
}

#[tokio::test]
async fn empty_candidates_are_retried_without_the_critic() {
    let n = AtomicUsize::new(0);
    let gateway = ScriptedGateway::new(move |req| {
        if req.attribution.caller == CRITIC {
            return Ok(ChatResponse::new("YES", TokenUsage::default()));
        }
        let text = if n.fetch_add(1, Ordering::SeqCst) == 0 { "   " } else { "Dayton." };
        Ok(ChatResponse::new(text, TokenUsage::default()))
    });
    let mut settings = settings(CriticFailurePolicy::FailOpen);
    settings.interview_questions.truncate(1);
    let generator = PersonaGenerator::new(gateway.clone(), &settings);

    let interview = generator.interview("seed").await;

    assert_eq!(interview.turns[0].attempts, 2);
    assert_eq!(interview.turns[0].qa.answer, "Dayton.");
    assert_eq!(gateway.calls_from(CRITIC), 1);
}

#[tokio::test]
async fn seed_frames_only_the_first_question_and_answers_carry_forward() {
    let gateway = gateway_with_critic(|| Ok("YES".into()));
    let generator = PersonaGenerator::new(gateway.clone(), &settings(CriticFailurePolicy::FailOpen))
        .with_model("local/llama-3-8b");

    generator.generate("A retiree in Florida.").await;

    let interviews: Vec<_> = gateway
        .requests()
        .into_iter()
        .filter(|r| r.attribution.caller == INTERVIEW)
        .collect();
    assert_eq!(interviews.len(), 2);
    assert!(interviews.iter().all(|r| r.model == "local/llama-3-8b"));
    assert!(interviews[0].messages[0]
        .content
        .ends_with("Persona Seed: A retiree in Florida."));
    assert!(!interviews[1].messages[0].content.contains("Persona Seed"));

    let second = &interviews[1].messages;
    assert_eq!(second.len(), 4);
    assert_eq!(second[2].role, Role::Assistant);
    assert_eq!(second[2].content, "answer 0");
    assert_eq!(second[3].content, "What do you do?");
}

#[tokio::test]
async fn batch_saves_personas_tagged_with_their_seed() {
    let store = temp_store();
    let gateway = gateway_with_critic(|| Ok("YES".into()));
    let settings = settings(CriticFailurePolicy::FailOpen);
    let generator = PersonaGenerator::new(gateway, &settings);
    let pool = vec!["A welder in Pittsburgh.".to_string()];

    let mut rng = StdRng::seed_from_u64(7);
    let ids = generator
        .generate_batch(&store, 2, &pool, &mut rng)
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    let personas = store.list_personas().await.unwrap();
    assert_eq!(personas.len(), 2);
    for persona in personas {
        assert_eq!(persona.model_signature, "gpt-4-turbo");
        assert!(persona.demographics.is_empty());
        assert_eq!(
            persona.custom_tags.get("seed"),
            Some(&Value::String("A welder in Pittsburgh.".into()))
        );
        assert!(persona.content.starts_with("Interviewer: Where did you grow up?"));
    }
}

#[tokio::test]
async fn batch_reports_store_failures_and_empty_pools() {
    let gateway = gateway_with_critic(|| Ok("YES".into()));
    let settings = settings(CriticFailurePolicy::FailOpen);
    let generator = PersonaGenerator::new(gateway, &settings);
    let mut rng = StdRng::seed_from_u64(1);

    let store = FailingStore::new(temp_store(), &["insert_persona"]);
    let err = generator
        .generate_batch(&store, 1, &["seed".to_string()], &mut rng)
        .await
        .unwrap_err();
    assert!(matches!(err, GeneratorError::Store { inserted: 0, .. }));

    let err = generator
        .generate_batch(&temp_store(), 1, &[], &mut rng)
        .await
        .unwrap_err();
    assert!(matches!(err, GeneratorError::EmptySeedPool));
}
