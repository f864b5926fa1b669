//! Bookmind - search and answer orchestration over a personal library
//!
//! Implements hybrid retrieval with grounded answer synthesis:
//! - Intent routing (rules, optional LLM classifier)
//! - Parallel exact / lemma / semantic strategies under timeouts and a deadline
//! - Weighted Reciprocal Rank Fusion plus concept-graph bridges
//! - Generator / judge loop with bounded attempts
//! - Circuit breakers, retries and a two-tier result cache

pub mod types;
pub mod error;
pub mod config;
pub mod text;
pub mod circuit_breaker;
pub mod retry;
pub mod cache;
pub mod embedding;
pub mod llm;
pub mod store;
pub mod in_memory_store;
pub mod http_store;
pub mod strategies;
pub mod semantic_strategy;
pub mod router;
pub mod fusion;
pub mod graph;
pub mod orchestrator;
pub mod agents;
pub mod answer;
pub mod service;
pub mod server;

pub use types::*;
pub use error::{AnswerError, ProviderError, SearchError, StoreError, StrategyError, StrategyFailure};
pub use config::EngineConfig;
pub use tokio_util::sync::CancellationToken;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use cache::{InMemorySharedCache, ResultCache, SharedCacheTier};
pub use embedding::{EmbeddingProvider, HashingEmbedder, HttpEmbeddingProvider};
pub use llm::{HttpLlmProvider, LlmProvider};
pub use store::CorpusStore;
pub use in_memory_store::InMemoryCorpus;
pub use http_store::HttpCorpusStore;
pub use strategies::RetrievalStrategy;
pub use orchestrator::SearchOrchestrator;
pub use answer::AnswerOrchestrator;
pub use service::{Bookmind, Providers};

#[cfg(test)]
mod tests;
