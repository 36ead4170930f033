//! Conversational coding-agent runtime: drives a dialogue with an
//! OpenAI-compatible backend and runs the tools the model asks for.

pub mod agent;
pub mod config;
pub mod hooks;
pub mod llm;
pub mod logging;
pub mod mcp;
pub mod tools;
