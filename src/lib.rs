//! Sales CRM Chat Assistant
//!
//! Answers natural-language questions about sales proposals and client
//! follow-ups:
//! - loads records from delimited files or the Zoho CRM API
//! - keeps a bounded per-session conversation memory
//! - grounds each LLM prompt in the records that match the question
//! - serves a browser chat page and a JSON API
//!
//! FLOW:
//! INTERFACE → QUERY HANDLER → (RECORDS, MEMORY, LLM) → INTERFACE

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod handler;
pub mod interface;
pub mod llm;
pub mod memory;
pub mod models;
pub mod retrieval;

pub use error::Result;

// Re-export common types
pub use config::AppConfig;
pub use handler::{Answer, BriefKind, QueryHandler};
pub use models::*;
