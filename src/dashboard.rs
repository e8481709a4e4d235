//! The dashboard's remote resources: payload types, cache keys, fetch
//! policies and the mutations that invalidate them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{to_value, ApiClient};
use crate::cache::CacheEntry;
use crate::config::Config;
use crate::error::FetchError;
use crate::fetcher::{fetch_fn, FetchDescriptor, Fetcher, Mutation};
use crate::key::{KeyFilter, ResourceKey};
use crate::sync::{Subscription, Synchronizer};

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub application: ServiceHealth,
    pub database: ServiceHealth,
    pub redis: ServiceHealth,
}

impl HealthStatus {
    pub fn all_healthy(&self) -> bool {
        [self.application, self.database, self.redis]
            .iter()
            .all(|s| *s == ServiceHealth::Healthy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub company_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    pub captured_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub prospecting_keywords: String,
}

/// Z-API (WhatsApp gateway) credentials and pacing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZapiConfig {
    #[serde(default)]
    pub zapi_instance_id: String,
    #[serde(default)]
    pub zapi_token: String,
    #[serde(default)]
    pub zapi_client_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_interval_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_delay_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_typing_indicator: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_seconds: Option<f64>,
}

impl ZapiConfig {
    pub fn message_interval(&self) -> f64 {
        self.message_interval_seconds.unwrap_or(1.5)
    }

    pub fn typing_delay(&self) -> f64 {
        self.typing_delay_seconds.unwrap_or(2.0)
    }

    pub fn typing_indicator(&self) -> bool {
        self.enable_typing_indicator.unwrap_or(true)
    }

    pub fn debounce(&self) -> f64 {
        self.debounce_seconds.unwrap_or(20.0)
    }
}

/// Settings of the message-testing sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(default = "default_typing_delay")]
    pub typing_delay_seconds: f64,
    #[serde(default = "default_debounce")]
    pub debounce_seconds: f64,
    #[serde(default)]
    pub system_prompt: String,
}

fn default_typing_delay() -> f64 {
    2.0
}

fn default_debounce() -> f64 {
    20.0
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            typing_delay_seconds: default_typing_delay(),
            debounce_seconds: default_debounce(),
            system_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestConversation {
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordsDeleted {
    #[serde(default)]
    pub total: u64,
    #[serde(flatten)]
    pub per_table: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetSummary {
    #[serde(default)]
    pub records_deleted: RecordsDeleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProspectingTask {
    pub task_id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneReceipt {
    pub phone: String,
}

// =============================================================================
// Keys
// =============================================================================

pub mod keys {
    use crate::key::ResourceKey;

    pub const CONVERSATION: &str = "conversation";
    pub const TEST_CONVERSATION: &str = "test-conversation";

    pub fn health() -> ResourceKey {
        ResourceKey::new("health")
    }

    pub fn metrics() -> ResourceKey {
        ResourceKey::new("metrics")
    }

    pub fn leads() -> ResourceKey {
        ResourceKey::new("leads")
    }

    pub fn conversations() -> ResourceKey {
        ResourceKey::new("conversations")
    }

    /// `conversation` alone is the "nobody selected" placeholder.
    pub fn conversation(user_id: Option<&str>) -> ResourceKey {
        let key = ResourceKey::new(CONVERSATION);
        match user_id {
            Some(id) => key.with_param(id),
            None => key,
        }
    }

    pub fn agent_config() -> ResourceKey {
        ResourceKey::new("agent-config")
    }

    pub fn zapi_config() -> ResourceKey {
        ResourceKey::new("zapi-config")
    }

    pub fn test_config() -> ResourceKey {
        ResourceKey::new("test-config")
    }

    pub fn test_conversation(phone: &str) -> ResourceKey {
        ResourceKey::new(TEST_CONVERSATION).with_param(phone)
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Fetcher that GETs a JSON endpoint and validates it against `T`.
fn typed_get<T>(api: &ApiClient, segments: &'static [&'static str]) -> Arc<dyn Fetcher>
where
    T: DeserializeOwned + Serialize + Send + 'static,
{
    let api = api.clone();
    fetch_fn(move |_key: ResourceKey| {
        let api = api.clone();
        async move { to_value(&api.get_typed::<T>(segments).await?) }
    })
}

/// Builds descriptors and mutations for every dashboard screen.
#[derive(Clone)]
pub struct Dashboard {
    cfg: Config,
    api: ApiClient,
    sync: Synchronizer,
}

impl Dashboard {
    pub fn new(cfg: Config, api: ApiClient, sync: Synchronizer) -> Self {
        Self { cfg, api, sync }
    }

    pub fn sync(&self) -> &Synchronizer {
        &self.sync
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    fn descriptor(&self, key: ResourceKey, fetcher: Arc<dyn Fetcher>) -> FetchDescriptor {
        FetchDescriptor::new(key, fetcher).stale_after(self.cfg.stale_after())
    }

    /// Service health, polled every 15 s by default.
    pub fn health(&self) -> FetchDescriptor {
        self.descriptor(keys::health(), typed_get::<HealthStatus>(&self.api, &["healthz"]))
            .every(self.cfg.health_poll())
    }

    /// Raw Prometheus text, polled every 30 s by default. Read it with
    /// [`crate::metrics::DashboardMetrics::from_entry`].
    pub fn metrics(&self) -> FetchDescriptor {
        let api = self.api.clone();
        let fetcher = fetch_fn(move |_key: ResourceKey| {
            let api = api.clone();
            async move { Ok(Value::String(api.get_text(&["metrics"]).await?)) }
        });
        self.descriptor(keys::metrics(), fetcher).every(self.cfg.metrics_poll())
    }

    pub fn leads(&self) -> FetchDescriptor {
        self.descriptor(keys::leads(), typed_get::<Vec<Lead>>(&self.api, &["leads"]))
    }

    /// Ids of the users that talked to the agent.
    pub fn conversations(&self) -> FetchDescriptor {
        self.descriptor(keys::conversations(), typed_get::<Vec<String>>(&self.api, &["conversations"]))
    }

    /// Messages of one user; disabled while nobody is selected.
    pub fn conversation(&self, user_id: Option<&str>) -> FetchDescriptor {
        let api = self.api.clone();
        let fetcher = fetch_fn(move |key: ResourceKey| {
            let api = api.clone();
            async move {
                let Some(user) = key.param(0) else {
                    return Ok(Value::Array(Vec::new()));
                };
                to_value(&api.get_typed::<Vec<Message>>(&["conversations", user]).await?)
            }
        });
        self.descriptor(keys::conversation(user_id), fetcher)
            .enabled(user_id.is_some())
    }

    pub fn agent_config(&self) -> FetchDescriptor {
        self.descriptor(keys::agent_config(), typed_get::<AgentConfig>(&self.api, &["agent-config"]))
    }

    pub fn zapi_config(&self) -> FetchDescriptor {
        self.descriptor(keys::zapi_config(), typed_get::<ZapiConfig>(&self.api, &["config", "zapi"]))
    }

    pub fn test_config(&self) -> FetchDescriptor {
        self.descriptor(keys::test_config(), typed_get::<TestConfig>(&self.api, &["test", "config"]))
    }

    pub fn test_conversation(&self, phone: &str) -> FetchDescriptor {
        let api = self.api.clone();
        let fetcher = fetch_fn(move |key: ResourceKey| {
            let api = api.clone();
            async move {
                let phone = key.param(0).unwrap_or_default();
                to_value(&api.get_typed::<TestConversation>(&["test", "conversation", phone]).await?)
            }
        });
        self.descriptor(keys::test_conversation(phone), fetcher)
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    pub fn save_agent_config_mutation(&self, config: &AgentConfig) -> Mutation {
        let api = self.api.clone();
        let body = config.clone();
        let fetcher = fetch_fn(move |_key: ResourceKey| {
            let api = api.clone();
            let body = body.clone();
            async move { api.post_json(&["agent-config"], &body).await }
        });
        Mutation::new(ResourceKey::new("save-agent-config"), fetcher).invalidates(keys::agent_config())
    }

    pub fn save_zapi_config_mutation(&self, config: &ZapiConfig) -> Mutation {
        let api = self.api.clone();
        let body = config.clone();
        let fetcher = fetch_fn(move |_key: ResourceKey| {
            let api = api.clone();
            let body = body.clone();
            async move { api.post_json(&["config", "zapi"], &body).await }
        });
        Mutation::new(ResourceKey::new("save-zapi-config"), fetcher).invalidates(keys::zapi_config())
    }

    pub fn save_test_config_mutation(&self, config: &TestConfig) -> Mutation {
        let api = self.api.clone();
        let query = vec![
            ("typing_delay", config.typing_delay_seconds.to_string()),
            ("debounce_seconds", config.debounce_seconds.to_string()),
            ("system_prompt", config.system_prompt.clone()),
        ];
        let fetcher = fetch_fn(move |_key: ResourceKey| {
            let api = api.clone();
            let query = query.clone();
            async move { api.post_query(&["test", "config"], &query).await }
        });
        Mutation::new(ResourceKey::new("save-test-config"), fetcher).invalidates(keys::test_config())
    }

    /// Wipes the backend database; every cached resource is dropped.
    pub fn reset_database_mutation(&self) -> Mutation {
        let api = self.api.clone();
        let fetcher = fetch_fn(move |_key: ResourceKey| {
            let api = api.clone();
            async move { api.delete(&["database", "reset"]).await }
        });
        Mutation::new(ResourceKey::new("reset-database"), fetcher).clears_all()
    }

    /// Kicks off a prospecting run. Nothing cached depends on it directly;
    /// the metrics poll picks up its effects.
    pub fn run_prospecting_mutation(&self) -> Mutation {
        let api = self.api.clone();
        let fetcher = fetch_fn(move |_key: ResourceKey| {
            let api = api.clone();
            async move { api.get_json(&["run-prospecting"]).await }
        });
        Mutation::new(ResourceKey::new("run-prospecting"), fetcher)
    }

    pub fn send_test_message_mutation(&self, phone: &str, message: &str) -> Mutation {
        let api = self.api.clone();
        let query = vec![("phone", phone.to_string()), ("message", message.to_string())];
        let fetcher = fetch_fn(move |_key: ResourceKey| {
            let api = api.clone();
            let query = query.clone();
            async move { api.post_query(&["test", "send-message"], &query).await }
        });
        Mutation::new(ResourceKey::new("send-test-message"), fetcher)
            .invalidates(keys::test_conversation(phone))
    }

    pub fn simulate_conversation_mutation(&self, phone: &str) -> Mutation {
        let api = self.api.clone();
        let query = vec![("phone", phone.to_string())];
        let fetcher = fetch_fn(move |_key: ResourceKey| {
            let api = api.clone();
            let query = query.clone();
            async move { api.post_query(&["test", "simulate-conversation"], &query).await }
        });
        Mutation::new(ResourceKey::new("simulate-conversation"), fetcher)
            .invalidates(keys::test_conversation(phone))
    }

    pub async fn save_agent_config(&self, config: &AgentConfig) -> Result<(), FetchError> {
        self.sync.mutate(&self.save_agent_config_mutation(config)).await.map(|_| ())
    }

    pub async fn save_zapi_config(&self, config: &ZapiConfig) -> Result<(), FetchError> {
        self.sync.mutate(&self.save_zapi_config_mutation(config)).await.map(|_| ())
    }

    pub async fn save_test_config(&self, config: &TestConfig) -> Result<(), FetchError> {
        self.sync.mutate(&self.save_test_config_mutation(config)).await.map(|_| ())
    }

    pub async fn reset_database(&self) -> Result<ResetSummary, FetchError> {
        let value = self.sync.mutate(&self.reset_database_mutation()).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn run_prospecting(&self) -> Result<ProspectingTask, FetchError> {
        let value = self.sync.mutate(&self.run_prospecting_mutation()).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn send_test_message(&self, phone: &str, message: &str) -> Result<PhoneReceipt, FetchError> {
        let value = self.sync.mutate(&self.send_test_message_mutation(phone, message)).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn simulate_conversation(&self, phone: &str) -> Result<PhoneReceipt, FetchError> {
        let value = self.sync.mutate(&self.simulate_conversation_mutation(phone)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Watch the conversation of whichever user is selected.
    pub fn conversation_view<F>(&self, callback: F) -> ConversationView
    where
        F: Fn(&CacheEntry) + Send + Sync + 'static,
    {
        ConversationView {
            dashboard: self.clone(),
            selected: None,
            sub: self.sync.subscribe(self.conversation(None), callback),
        }
    }
}

/// The conversation pane: one subscription that follows the selected user.
pub struct ConversationView {
    dashboard: Dashboard,
    selected: Option<String>,
    sub: Subscription,
}

impl ConversationView {
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Select a user (or nobody). An answer still pending for the previous
    /// user is dropped, and so is its cached thread unless another pane
    /// still shows it.
    pub fn select(&mut self, user_id: Option<&str>) {
        if self.selected.as_deref() == user_id {
            return;
        }
        let previous = self.sub.key().clone();
        self.selected = user_id.map(str::to_string);
        self.sub.retarget(self.dashboard.conversation(user_id));
        self.dashboard.sync().evict_unwatched(&KeyFilter::Exact(previous));
    }

    pub fn entry(&self) -> CacheEntry {
        self.sub.entry()
    }

    pub fn messages(&self) -> Result<Vec<Message>, FetchError> {
        self.entry().decode().unwrap_or_else(|| Ok(Vec::new()))
    }

    pub fn key(&self) -> &ResourceKey {
        self.sub.key()
    }
}

/// Invalidate every conversation pane, e.g. after new messages arrived.
pub fn all_conversations() -> KeyFilter {
    KeyFilter::Name(keys::CONVERSATION.to_string())
}
