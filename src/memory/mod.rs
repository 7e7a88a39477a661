//! Conversation Memory
//!
//! Per-session turn logs and the registry of live sessions. Nothing here
//! outlives the process.

pub mod session;
pub mod store;

pub use session::{SessionContext, SessionRegistry, SharedSession, UserProfile};
pub use store::{ConversationMemory, ConversationTurn, TurnRole};
