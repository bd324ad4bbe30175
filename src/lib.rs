//! Tenant-aware conversation flows.
//!
//! Inbound chat messages are routed to a tenant by their destination address
//! and walked through that tenant's [`graph::ConversationGraph`] by the
//! [`orchestrator::FlowOrchestrator`]. Nodes may bind named
//! [`action::Action`]s that fire on arrival or departure, and sessions can be
//! handed to a live agent, after which messages are forwarded instead of
//! answered.

pub mod action;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod lock;
pub mod logger;
pub mod message;
pub mod orchestrator;
pub mod render;
pub mod scenario;
pub mod session;
pub mod store;
pub mod tenant;
pub mod watcher;
