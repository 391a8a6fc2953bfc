use crate::failover::RetryPolicy;
use deckwright_core::{DeckwrightError, DeckwrightResult, ThinkingLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Everything the orchestrator and the agent loop need, built once at
/// startup and shared by reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub models: ModelTiers,
    #[serde(default)]
    pub budgets: TokenBudgets,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub repair: RepairSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub pricing: PricingTable,
}

impl RecoveryConfig {
    /// Parses a TOML document. Missing sections and fields take defaults.
    pub fn from_toml_str(raw: &str) -> DeckwrightResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| DeckwrightError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> DeckwrightResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Rejects settings that would make the loop or the pipeline useless.
    pub fn validate(&self) -> DeckwrightResult<()> {
        if self.agent.max_iterations == 0 {
            return Err(DeckwrightError::Config(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if self.agent.max_tool_retries == 0 {
            return Err(DeckwrightError::Config(
                "agent.max_tool_retries must be at least 1".into(),
            ));
        }
        if self.repair.max_repair_bytes == 0 {
            return Err(DeckwrightError::Config(
                "repair.max_repair_bytes must be greater than zero".into(),
            ));
        }
        for (tier, model) in [
            ("routine", &self.models.routine),
            ("escalated", &self.models.escalated),
            ("lite", &self.models.lite),
            ("repair", &self.models.repair),
        ] {
            if model.trim().is_empty() {
                return Err(DeckwrightError::Config(format!(
                    "models.{tier} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    /// Explicit key; wins over `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_provider_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            api_key: None,
            api_key_env: default_provider_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ProviderConfig {
    pub fn api_key(&self) -> Option<String> {
        resolve_key(self.api_key.as_deref(), &self.api_key_env)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Model identifiers per call class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTiers {
    #[serde(default = "default_routine_model")]
    pub routine: String,
    #[serde(default = "default_escalated_model")]
    pub escalated: String,
    /// Cheaper variant used for the empty-response retry.
    #[serde(default = "default_lite_model")]
    pub lite: String,
    /// Model asked to re-emit valid JSON when local repair fails.
    #[serde(default = "default_lite_model")]
    pub repair: String,
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            routine: default_routine_model(),
            escalated: default_escalated_model(),
            lite: default_lite_model(),
            repair: default_lite_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudgets {
    #[serde(default = "default_output_tokens")]
    pub default_output_tokens: u32,
    /// Budget for the retry after an empty response; larger on purpose.
    #[serde(default = "default_empty_retry_tokens")]
    pub empty_retry_output_tokens: u32,
    #[serde(default = "default_output_tokens")]
    pub repair_output_tokens: u32,
    #[serde(default = "default_empty_retry_grace_ms")]
    pub empty_retry_grace_ms: u64,
    #[serde(default)]
    pub default_thinking: Option<ThinkingLevel>,
}

impl Default for TokenBudgets {
    fn default() -> Self {
        Self {
            default_output_tokens: default_output_tokens(),
            empty_retry_output_tokens: default_empty_retry_tokens(),
            repair_output_tokens: default_output_tokens(),
            empty_retry_grace_ms: default_empty_retry_grace_ms(),
            default_thinking: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairSettings {
    /// Text above this size is not repaired; the fallback value is returned.
    #[serde(default = "default_max_repair_bytes")]
    pub max_repair_bytes: usize,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
    /// Ask the repair model when every local layer fails.
    #[serde(default = "default_true")]
    pub escalate: bool,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            max_repair_bytes: default_max_repair_bytes(),
            excerpt_chars: default_excerpt_chars(),
            escalate: true,
        }
    }
}

/// How much of the conversation each loop iteration sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextFolding {
    /// Only the newest tool results, chained to the previous interaction id.
    #[default]
    ServerDelta,
    /// The whole history on every turn.
    FullHistory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_tool_retries")]
    pub max_tool_retries: u32,
    #[serde(default)]
    pub context_folding: ContextFolding,
    #[serde(default = "default_true")]
    pub thread_thought_signatures: bool,
    /// Run the calls of one batch concurrently. Only for side-effect-free tools.
    #[serde(default)]
    pub parallel_tools: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tool_retries: default_max_tool_retries(),
            context_folding: ContextFolding::default(),
            thread_thought_signatures: true,
            parallel_tools: false,
        }
    }
}

/// OpenAI-compatible provider used when the primary returns nothing twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_base_url")]
    pub base_url: String,
    #[serde(default = "default_fallback_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_fallback_key_env")]
    pub api_key_env: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            base_url: default_fallback_base_url(),
            model: default_fallback_model(),
            api_key: None,
            api_key_env: default_fallback_key_env(),
        }
    }
}

impl FallbackConfig {
    /// `None` means the fallback is silently disabled.
    pub fn api_key(&self) -> Option<String> {
        resolve_key(self.api_key.as_deref(), &self.api_key_env)
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default)]
    pub models: BTreeMap<String, ModelPrice>,
    /// Savings are computed against this model's prices.
    #[serde(default)]
    pub reference_model: Option<String>,
}

fn resolve_key(explicit: Option<&str>, env_var: &str) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok())
        .filter(|key| !key.trim().is_empty())
}

fn default_provider_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_provider_key_env() -> String {
    "GEMINI_API_KEY".into()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_routine_model() -> String {
    "gemini-2.5-flash".into()
}

fn default_escalated_model() -> String {
    "gemini-2.5-pro".into()
}

fn default_lite_model() -> String {
    "gemini-2.5-flash-lite".into()
}

fn default_output_tokens() -> u32 {
    8192
}

fn default_empty_retry_tokens() -> u32 {
    16_384
}

fn default_empty_retry_grace_ms() -> u64 {
    1_000
}

fn default_max_repair_bytes() -> usize {
    deckwright_repair::DEFAULT_MAX_REPAIR_BYTES
}

fn default_excerpt_chars() -> usize {
    500
}

fn default_max_iterations() -> u32 {
    10
}

fn default_max_tool_retries() -> u32 {
    3
}

fn default_fallback_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_fallback_model() -> String {
    "gpt-4o-mini".into()
}

fn default_fallback_key_env() -> String {
    "OPENAI_API_KEY".into()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RecoveryConfig::from_toml_str("").unwrap();
        assert_eq!(config.agent.max_iterations, 10);
        assert_eq!(config.agent.max_tool_retries, 3);
        assert_eq!(config.agent.context_folding, ContextFolding::ServerDelta);
        assert_eq!(config.repair.max_repair_bytes, 15_000);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.repair.escalate);
    }

    #[test]
    fn test_partial_sections() {
        let config = RecoveryConfig::from_toml_str(
            r#"
            [models]
            routine = "model-a"

            [agent]
            context_folding = "full_history"
            parallel_tools = true

            [pricing]
            reference_model = "model-b"

            [pricing.models.model-a]
            input_per_million = 0.1
            output_per_million = 0.4
            "#,
        )
        .unwrap();
        assert_eq!(config.models.routine, "model-a");
        assert_eq!(config.models.lite, "gemini-2.5-flash-lite");
        assert_eq!(config.agent.context_folding, ContextFolding::FullHistory);
        assert!(config.agent.parallel_tools);
        assert_eq!(config.pricing.models["model-a"].output_per_million, 0.4);
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let err = RecoveryConfig::from_toml_str("[agent]\nmax_iterations = 0").unwrap_err();
        assert!(err.to_string().contains("max_iterations"));

        let err = RecoveryConfig::from_toml_str("[repair]\nmax_repair_bytes = 0").unwrap_err();
        assert!(err.to_string().contains("max_repair_bytes"));

        let err = RecoveryConfig::from_toml_str("[models]\nrepair = \"\"").unwrap_err();
        assert!(err.to_string().contains("models.repair"));
    }

    #[test]
    fn test_explicit_key_wins() {
        let provider = ProviderConfig {
            api_key: Some("explicit".into()),
            api_key_env: "DECKWRIGHT_TEST_UNSET_VARIABLE".into(),
            ..ProviderConfig::default()
        };
        assert_eq!(provider.api_key().as_deref(), Some("explicit"));
    }

    #[test]
    fn test_missing_fallback_key_is_none() {
        let fallback = FallbackConfig {
            api_key: None,
            api_key_env: "DECKWRIGHT_TEST_SURELY_UNSET_KEY".into(),
            ..FallbackConfig::default()
        };
        assert!(fallback.api_key().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deckwright.toml");
        std::fs::write(&path, "[agent]\nmax_iterations = 4\n").unwrap();
        let config = RecoveryConfig::load(&path).unwrap();
        assert_eq!(config.agent.max_iterations, 4);
    }
}
