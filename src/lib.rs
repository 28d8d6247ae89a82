//! mcp-jobs: queued LLM agent jobs over a supervised MCP toolkit process.

pub mod agent;
pub mod api;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod queue;
pub mod scopes;
pub mod store;
pub mod tokens;
