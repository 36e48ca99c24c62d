pub mod chat;
pub mod column_mapping;
pub mod comparator;
pub mod completion;
pub mod file_parser;
pub mod generation;
pub mod partial_json;
pub mod prompts;
pub mod reconciler;
pub mod rule_patch;
pub mod session;
pub mod views;
