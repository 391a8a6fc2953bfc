//! Structured-output orchestration and the tool-calling agent loop.
//!
//! [`StructuredOutputOrchestrator`] turns one prompt into a parsed JSON
//! value, recovering from empty, degenerate and malformed responses.
//! [`AgentLoop`] drives a multi-turn tool-calling conversation against the
//! Interactions API with server-side context folding.

pub mod backends;
pub mod config;
pub mod context;
pub mod failover;
pub mod ledger;
pub mod runner;
pub mod structured;
pub mod tools;

pub use backends::interactions::InteractionsBackend;
pub use backends::openai::OpenAiFallback;
pub use backends::InteractionBackend;
pub use config::{
    AgentSettings, ContextFolding, FallbackConfig, ModelPrice, ModelTiers, PricingTable,
    ProviderConfig, RecoveryConfig, RepairSettings, TokenBudgets,
};
pub use context::{is_continuation_rejection, ConversationContext};
pub use failover::{compute_backoff, is_retryable, RetryPolicy, RetryingBackend};
pub use ledger::{CostLedger, LedgerSnapshot, ModelUsage};
pub use runner::{AgentLoop, AgentRun};
pub use structured::{
    Provenance, StructuredOutput, StructuredOutputOrchestrator, StructuredRequest,
};
pub use tools::{classify_tool_error, BoxError, Tool, ToolRegistry};
