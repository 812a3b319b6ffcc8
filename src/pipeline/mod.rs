//! Classification pipeline.
//!
//! Every new message flows through:
//! 1. `PartExtractor::extract()`: part tree to plain-text body and attachments
//! 2. `PromptBuilder::build()`: budgeted prompt from the fixed template
//! 3. `Classifier::classify()`: one request to the local model
//! 4. `TagRules::derive()`: flags to tag keys, unioned with existing tags
//!
//! `MessageProcessor` sequences the steps and isolates per-message failures.
//! Tags are only ever added.

pub mod extract;
pub mod listener;
pub mod processor;
pub mod prompt;
pub mod tags;
pub mod types;
