//! Message processing pipeline.
//!
//! Each invocation handles exactly one message:
//! 1. `parser::parse()`: raw bytes → `ParsedMessage`
//! 2. `RuleMatcher::should_skip()` / `match_rule()`: no LLM
//! 3. `ReplyGenerator::generate()`: provider call under retry
//! 4. `DeliveryRouter::route()`: send or draft

pub mod generator;
pub mod parser;
pub mod processor;
pub mod rules;
pub mod types;

pub use processor::MessageProcessor;
