pub mod config;
pub mod discovery;
pub mod filter;
pub mod formatter;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod sources;
pub mod stages;
pub mod store;
pub mod telegram;
