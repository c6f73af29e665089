#![forbid(unsafe_code)]

//! # alterity-engine
//!
//! Runs simulated surveys against language models.
//!
//! A survey run answers every probe either by stating a demographic profile to
//! the model outright (demographic forcing) or by matching the profile against a
//! corpus of generated personas and answering in each matched persona's voice
//! (alterity). Personas come from a critique-gated life-history interview and
//! can be tagged with zero-shot trait labels.
//!
//! Entry points: [`RunExecutor`], [`PersonaGenerator`], [`TraitLabeler`], and
//! the line-oriented [`Worker`] that dispatches jobs to them.

pub mod assignment;
pub mod config;
pub mod demographics;
pub mod executor;
pub mod gateway;
pub mod generator;
pub mod labeler;
pub mod matcher;
pub mod model;
pub mod prompts;
pub mod store;
pub mod worker;

pub use config::{CriticFailurePolicy, EngineSettings};
pub use demographics::{DemographicProfile, ScalarValue, TraitValue};
pub use executor::{RunDisposition, RunExecutor, RunOutcome};
pub use gateway::{Attribution, ChatGateway, PricingTable, ProviderGateway, UsageSink};
pub use generator::{Interview, PersonaGenerator};
pub use labeler::{LabelReport, TraitLabeler, TraitVerdict};
pub use matcher::{MatchParams, PersonaMatch, WeightedMatcher};
pub use model::{Methodology, Persona, RunStatus, SurveyRun};
pub use store::{SqliteSurveyStore, StoreError, SurveyStore};
pub use worker::{Job, JobReport, Worker};
