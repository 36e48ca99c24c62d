use moka::sync::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ColumnMapping, ConversionScripts, DbtRuleSet, FileData, NamedDataset, SchemaModel};
use crate::services::completion::ChatMessage;
use crate::services::prompts;

const MAX_SESSIONS: u64 = 1_000;

/// User-adjustable generation settings. They survive a new file load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub model: String,
    /// Custom schema prompt; `None` uses the built-in one.
    pub schema_prompt: Option<String>,
    pub dbt_rules_prompt: Option<String>,
    pub global_table_rules: String,
}

impl SessionSettings {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            schema_prompt: None,
            dbt_rules_prompt: None,
            global_table_rules: String::new(),
        }
    }

    pub fn schema_template(&self) -> &str {
        self.schema_prompt.as_deref().unwrap_or(prompts::DEFAULT_SCHEMA_PROMPT)
    }

    pub fn dbt_rules_template(&self) -> &str {
        self.dbt_rules_prompt.as_deref().unwrap_or(prompts::DEFAULT_DBT_RULES_PROMPT)
    }
}

/// Two datasets and the mapping between them, kept for aggregation runs.
#[derive(Debug, Clone)]
pub struct ComparisonContext {
    pub first: NamedDataset,
    pub second: NamedDataset,
    pub mapping: ColumnMapping,
}

/// Independent mutation targets. One streaming operation per lane at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Schema,
    /// Rule generation and rule chat both rewrite the rule set.
    Rules,
    Comparison,
    Ingestion,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lane::Schema => "schema generation",
            Lane::Rules => "DBT rule update",
            Lane::Comparison => "dataset comparison",
            Lane::Ingestion => "conversion script generation",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub settings: SessionSettings,
    pub file: Option<FileData>,
    pub schema: Option<SchemaModel>,
    pub rules: Option<DbtRuleSet>,
    pub scripts: Option<ConversionScripts>,
    pub history: Vec<ChatMessage>,
    pub comparison: Option<Arc<ComparisonContext>>,
    busy: BTreeSet<Lane>,
    /// Bumped on every file load so results computed against an older file
    /// are not stored.
    epoch: u64,
}

impl Session {
    pub fn new(id: String, model: &str) -> Self {
        Self {
            id,
            settings: SessionSettings::new(model),
            file: None,
            schema: None,
            rules: None,
            scripts: None,
            history: Vec::new(),
            comparison: None,
            busy: BTreeSet::new(),
            epoch: 0,
        }
    }

    /// Replaces the whole file context: everything derived from the previous
    /// file is dropped, settings are kept.
    pub fn load_file(&mut self, file: FileData) {
        tracing::info!(
            "Session {} loaded '{}' ({} sheets)",
            self.id,
            file.name,
            file.sheets.len()
        );
        self.file = Some(file);
        self.schema = None;
        self.rules = None;
        self.scripts = None;
        self.history.clear();
        self.comparison = None;
        self.epoch += 1;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_busy(&self, lane: Lane) -> bool {
        self.busy.contains(&lane)
    }

    /// Data context handed to chat prompts.
    pub fn chat_context(&self, attached: Option<&FileData>) -> Value {
        json!({
            "fileData": self.file.as_ref().or(attached),
            "schema": self.schema,
            "dbtRules": self.rules,
            "attachedFile": attached,
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            settings: self.settings.clone(),
            file: self.file.clone(),
            schema: self.schema.clone(),
            dbt_rules: self.rules.clone(),
            rules_summary: self.rules.as_ref().map(DbtRuleSet::rules_summary),
            conversion_scripts: self.scripts.clone(),
            history: self.history.clone(),
            has_comparison: self.comparison.is_some(),
            busy: self.busy.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub settings: SessionSettings,
    pub file: Option<FileData>,
    pub schema: Option<SchemaModel>,
    pub dbt_rules: Option<DbtRuleSet>,
    pub rules_summary: Option<String>,
    pub conversion_scripts: Option<ConversionScripts>,
    pub history: Vec<ChatMessage>,
    pub has_comparison: bool,
    pub busy: Vec<Lane>,
}

pub type SharedSession = Arc<Mutex<Session>>;

/// In-memory sessions, evicted after a period without access.
pub struct SessionStore {
    sessions: Cache<String, SharedSession>,
}

impl SessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        let sessions = Cache::builder()
            .max_capacity(MAX_SESSIONS)
            .time_to_idle(idle_ttl)
            .build();
        Self { sessions }
    }

    pub fn create(&self, model: &str) -> SharedSession {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Mutex::new(Session::new(id.clone(), model)));
        self.sessions.insert(id.clone(), session.clone());
        tracing::info!("Created session {}", id);
        session
    }

    pub fn get(&self, id: &str) -> Result<SharedSession, AppError> {
        self.sessions
            .get(id)
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }
}

/// Holds a lane of a session for the duration of one operation. The lane is
/// freed on drop, including when a streaming response is abandoned.
#[derive(Debug)]
pub struct OperationGuard {
    session: SharedSession,
    lane: Lane,
}

impl OperationGuard {
    pub fn claim(session: &SharedSession, lane: Lane) -> Result<Self, AppError> {
        let mut state = session.lock();
        if !state.busy.insert(lane) {
            tracing::warn!("Rejected concurrent {} on session {}", lane, state.id);
            return Err(AppError::Busy(lane.to_string()));
        }
        Ok(Self {
            session: session.clone(),
            lane,
        })
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.session.lock().busy.remove(&self.lane);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> FileData {
        FileData {
            name: name.into(),
            file_type: "csv".into(),
            sheets: vec![],
            tables: vec![],
        }
    }

    #[test]
    fn second_claim_on_a_lane_is_rejected_until_release() {
        let store = SessionStore::new(Duration::from_secs(60));
        let session = store.create("gpt-4.1-mini");

        let guard = OperationGuard::claim(&session, Lane::Rules).unwrap();
        assert!(matches!(
            OperationGuard::claim(&session, Lane::Rules),
            Err(AppError::Busy(_))
        ));
        let other = OperationGuard::claim(&session, Lane::Schema).unwrap();
        assert!(session.lock().is_busy(Lane::Schema));

        drop(guard);
        drop(other);
        assert!(!session.lock().is_busy(Lane::Rules));
        assert!(OperationGuard::claim(&session, Lane::Rules).is_ok());
    }

    #[test]
    fn loading_a_file_resets_derived_state_but_keeps_settings() {
        let mut session = Session::new("s".into(), "m");
        session.settings.global_table_rules = "facts end in _fct".into();
        session.schema = Some(SchemaModel::default());
        session.rules = Some(DbtRuleSet::default());
        session.scripts = Some(ConversionScripts::default());
        session.history.push(ChatMessage::user("hi"));

        session.load_file(file("b.csv"));

        assert_eq!(session.file.as_ref().unwrap().name, "b.csv");
        assert!(session.schema.is_none());
        assert!(session.rules.is_none());
        assert!(session.scripts.is_none());
        assert!(session.history.is_empty());
        assert_eq!(session.epoch(), 1);
        assert_eq!(session.settings.global_table_rules, "facts end in _fct");
    }

    #[test]
    fn unknown_session_is_not_found() {
        let store = SessionStore::new(Duration::from_secs(60));
        assert!(matches!(store.get("nope"), Err(AppError::SessionNotFound(_))));
        let session = store.create("m");
        let id = session.lock().id.clone();
        assert!(store.get(&id).is_ok());
    }

    #[test]
    fn custom_prompts_fall_back_to_defaults() {
        let mut settings = SessionSettings::new("m");
        assert_eq!(settings.schema_template(), prompts::DEFAULT_SCHEMA_PROMPT);
        settings.schema_prompt = Some("custom ${fileData.name}".into());
        assert_eq!(settings.schema_template(), "custom ${fileData.name}");
    }
}
