#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use alterity_engine::gateway::{ChatGateway, ChatRequest, ChatResponse, ProviderError, TokenUsage};
use alterity_engine::model::{
    DemographicConfig, NewPersona, NewResult, Persona, Probe, ResultRecord, RunStatus, SurveyRun,
};
use alterity_engine::store::{RunTotals, SqliteSurveyStore, StoreError, SurveyStore};

pub fn temp_store() -> SqliteSurveyStore {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let path = dir.path().join("test_alterity.sqlite");
    // Leak the TempDir so it persists for the test
    std::mem::forget(dir);
    SqliteSurveyStore::new(path).expect("create store")
}

/// Survey with one probe per entry; returns (survey_id, probe_ids).
pub async fn seed_survey(store: &SqliteSurveyStore, probes: &[&str]) -> (i64, Vec<i64>) {
    let survey = store.create_survey("test survey").await.expect("survey");
    let mut ids = Vec::new();
    for content in probes {
        ids.push(
            store
                .add_probe(survey.id, content, "TEXT", None)
                .await
                .expect("probe"),
        );
    }
    (survey.id, ids)
}

pub fn run_config(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// =============================================================================
// Scripted gateway
// =============================================================================

type Responder = dyn Fn(&ChatRequest) -> Result<ChatResponse, ProviderError> + Send + Sync;

/// Gateway that records every request and answers from a closure.
pub struct ScriptedGateway {
    responder: Box<Responder>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedGateway {
    pub fn new(
        responder: impl Fn(&ChatRequest) -> Result<ChatResponse, ProviderError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Same text and usage for every call.
    pub fn replying(text: &str, usage: TokenUsage) -> Arc<Self> {
        let text = text.to_string();
        Self::new(move |_| Ok(ChatResponse::new(text.clone(), usage)))
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls_from(&self, caller: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.attribution.caller == caller)
            .count()
    }
}

#[async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        (self.responder)(&req)
    }
}

// =============================================================================
// Fault-injecting store
// =============================================================================

/// Delegates to SQLite but fails the named operations. Every successful
/// status write is followed by a read-back of the persisted status.
pub struct FailingStore {
    inner: SqliteSurveyStore,
    fail: HashSet<&'static str>,
    statuses: Mutex<Vec<RunStatus>>,
}

impl FailingStore {
    pub fn new(inner: SqliteSurveyStore, fail: &[&'static str]) -> Self {
        Self {
            inner,
            fail: fail.iter().copied().collect(),
            statuses: Mutex::new(Vec::new()),
        }
    }

    /// Statuses read back after each status write, in order.
    pub fn status_history(&self) -> Vec<RunStatus> {
        self.statuses.lock().unwrap().clone()
    }

    async fn record_status(&self, run_id: i64) {
        if let Ok(run) = self.inner.get_run(run_id).await {
            self.statuses.lock().unwrap().push(run.status);
        }
    }

    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        if self.fail.contains(op) {
            Err(StoreError::Unavailable(format!("injected failure in {op}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SurveyStore for FailingStore {
    async fn get_run(&self, run_id: i64) -> Result<SurveyRun, StoreError> {
        self.check("get_run")?;
        self.inner.get_run(run_id).await
    }

    async fn claim_run(&self, run_id: i64) -> Result<bool, StoreError> {
        self.check("claim_run")?;
        let claimed = self.inner.claim_run(run_id).await?;
        if claimed {
            self.record_status(run_id).await;
        }
        Ok(claimed)
    }

    async fn update_run_status(&self, run_id: i64, status: RunStatus) -> Result<(), StoreError> {
        self.check("update_run_status")?;
        self.inner.update_run_status(run_id, status).await?;
        self.record_status(run_id).await;
        Ok(())
    }

    /// Never injected: the executor's recovery path must always reach SQLite.
    async fn fail_run(&self, run_id: i64) -> Result<bool, StoreError> {
        let failed = self.inner.fail_run(run_id).await?;
        if failed {
            self.record_status(run_id).await;
        }
        Ok(failed)
    }

    async fn commit_run_results(
        &self,
        run_id: i64,
        results: Vec<NewResult>,
        totals: RunTotals,
    ) -> Result<(), StoreError> {
        self.check("commit_run_results")?;
        self.inner.commit_run_results(run_id, results, totals).await?;
        self.record_status(run_id).await;
        Ok(())
    }

    async fn list_results(&self, run_id: i64) -> Result<Vec<ResultRecord>, StoreError> {
        self.inner.list_results(run_id).await
    }

    async fn list_probes(&self, survey_id: i64) -> Result<Vec<Probe>, StoreError> {
        self.check("list_probes")?;
        self.inner.list_probes(survey_id).await
    }

    async fn get_demographic_config(
        &self,
        config_id: i64,
    ) -> Result<DemographicConfig, StoreError> {
        self.check("get_demographic_config")?;
        self.inner.get_demographic_config(config_id).await
    }

    async fn list_personas(&self) -> Result<Vec<Persona>, StoreError> {
        self.check("list_personas")?;
        self.inner.list_personas().await
    }

    async fn insert_persona(&self, persona: NewPersona) -> Result<i64, StoreError> {
        self.check("insert_persona")?;
        self.inner.insert_persona(persona).await
    }

    async fn set_persona_tag(
        &self,
        persona_id: i64,
        key: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        self.check("set_persona_tag")?;
        self.inner.set_persona_tag(persona_id, key, value).await
    }

    async fn get_configuration(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.check("get_configuration")?;
        self.inner.get_configuration(key).await
    }

    async fn get_feature_flag(&self, name: &str) -> Result<Option<bool>, StoreError> {
        self.check("get_feature_flag")?;
        self.inner.get_feature_flag(name).await
    }
}
