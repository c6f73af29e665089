mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use alterity_engine::demographics::DemographicProfile;
use alterity_engine::gateway::{
    ChatGateway, ChatRequest, ChatResponse, ProviderError, TokenUsage,
};
use alterity_engine::labeler::{LabelReport, TraitLabeler};
use alterity_engine::model::NewPersona;
use alterity_engine::{EngineSettings, SqliteSurveyStore, SurveyStore};

use common::{temp_store, ScriptedGateway};

async fn add_persona(store: &SqliteSurveyStore, content: &str) -> i64 {
    store
        .insert_persona(NewPersona {
            content: content.into(),
            model_signature: "gpt-4-turbo".into(),
            demographics: DemographicProfile::new(),
            custom_tags: Map::new(),
        })
        .await
        .unwrap()
}

/// Classifier that answers from keywords in the persona text.
fn keyword_classifier() -> Arc<ScriptedGateway> {
    ScriptedGateway::new(|req| {
        let prompt = &req.messages[1].content;
        let reply = if prompt.contains("my dog") {
            "Yes"
        } else if prompt.contains("allergic") {
            "No."
        } else {
            "Unknown"
        };
        Ok(ChatResponse::new(reply, TokenUsage::new(3, 1)))
    })
}

#[tokio::test]
async fn labels_definite_verdicts_and_skips_them_next_time() {
    let store = temp_store();
    let dog = add_persona(&store, "I walk my dog every morning.").await;
    let allergic = add_persona(&store, "I am allergic to fur.").await;
    let unclear = add_persona(&store, "I like long walks.").await;

    let gateway = keyword_classifier();
    let labeler = TraitLabeler::new(gateway.clone(), &EngineSettings::default());

    let first = labeler.label(&store, "owns a dog").await.unwrap();
    assert_eq!(
        first,
        LabelReport {
            classified: 3,
            updated: 2
        }
    );

    let personas = store.list_personas().await.unwrap();
    let tag = |id: i64| {
        personas
            .iter()
            .find(|p| p.id == id)
            .and_then(|p| p.custom_tags.get("owns a dog").cloned())
    };
    assert_eq!(tag(dog), Some(Value::Bool(true)));
    assert_eq!(tag(allergic), Some(Value::Bool(false)));
    assert_eq!(tag(unclear), None);

    // Only the undetermined persona is asked again.
    let second = labeler.label(&store, "owns a dog").await.unwrap();
    assert_eq!(
        second,
        LabelReport {
            classified: 1,
            updated: 0
        }
    );
    assert_eq!(gateway.requests().len(), 4);
}

#[tokio::test]
async fn fully_labeled_corpus_makes_no_calls() {
    let store = temp_store();
    add_persona(&store, "I walk my dog.").await;
    add_persona(&store, "I am allergic to fur.").await;
    let gateway = keyword_classifier();
    let labeler = TraitLabeler::new(gateway.clone(), &EngineSettings::default());

    labeler.label(&store, "owns a dog").await.unwrap();
    let calls = gateway.requests().len();
    let again = labeler.label(&store, "owns a dog").await.unwrap();

    assert_eq!(again, LabelReport::default());
    assert_eq!(gateway.requests().len(), calls);
}

#[tokio::test]
async fn classifier_sees_at_most_the_char_budget() {
    let store = temp_store();
    let long = format!("{}TAIL", "a".repeat(3000));
    add_persona(&store, &long).await;
    let gateway = ScriptedGateway::replying("Unknown", TokenUsage::default());
    let labeler = TraitLabeler::new(gateway.clone(), &EngineSettings::default());

    labeler.label(&store, "likes jazz").await.unwrap();

    let prompt = &gateway.requests()[0].messages[1].content;
    assert!(prompt.contains(&"a".repeat(2000)));
    assert!(!prompt.contains(&"a".repeat(2001)));
    assert!(!prompt.contains("TAIL"));
    assert!(prompt.contains("'likes jazz'"));
}

#[tokio::test]
async fn failed_classifier_calls_leave_tags_absent() {
    let store = temp_store();
    add_persona(&store, "I walk my dog.").await;
    let gateway = ScriptedGateway::new(|_| Err(ProviderError::backend("test", "down", false)));
    let labeler = TraitLabeler::new(gateway, &EngineSettings::default());

    let report = labeler.label(&store, "owns a dog").await.unwrap();

    assert_eq!(report.updated, 0);
    let personas = store.list_personas().await.unwrap();
    assert!(personas[0].custom_tags.is_empty());
}

#[tokio::test]
async fn blank_trait_is_rejected() {
    let store = temp_store();
    let labeler = TraitLabeler::new(
        ScriptedGateway::replying("Yes", TokenUsage::default()),
        &EngineSettings::default(),
    );
    assert!(labeler.label(&store, "   ").await.is_err());
}

/// Classifier that lets another labeling job tag the persona while the call is
/// in flight, then answers "Yes".
struct ConcurrentTagger {
    store: SqliteSurveyStore,
    persona_id: i64,
}

#[async_trait]
impl ChatGateway for ConcurrentTagger {
    async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.store
            .set_persona_tag(self.persona_id, "votes", Value::Bool(true))
            .await
            .expect("concurrent tag");
        Ok(ChatResponse::new("Yes", TokenUsage::new(3, 1)))
    }
}

#[tokio::test]
async fn concurrent_labels_on_one_persona_both_survive() {
    let store = temp_store();
    let mut seed = Map::new();
    seed.insert("seed".into(), Value::String("s".into()));
    let id = store
        .insert_persona(NewPersona {
            content: "I walk my dog before voting.".into(),
            model_signature: "gpt-4-turbo".into(),
            demographics: DemographicProfile::new(),
            custom_tags: seed,
        })
        .await
        .unwrap();

    let gateway = Arc::new(ConcurrentTagger {
        store: store.clone(),
        persona_id: id,
    });
    let labeler = TraitLabeler::new(gateway, &EngineSettings::default());
    let report = labeler.label(&store, "owns a dog").await.unwrap();
    assert_eq!(report.updated, 1);

    let personas = store.list_personas().await.unwrap();
    let tags = &personas[0].custom_tags;
    assert_eq!(tags.get("owns a dog"), Some(&Value::Bool(true)));
    assert_eq!(tags.get("votes"), Some(&Value::Bool(true)));
    assert_eq!(tags.get("seed"), Some(&Value::String("s".into())));
}
