//! Mail tagger: classifies email with a local LLM and applies tags.

pub mod config;
pub mod error;
pub mod llm;
pub mod mime;
pub mod pipeline;
pub mod store;
