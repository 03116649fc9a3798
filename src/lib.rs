//! Courier: bulk WhatsApp dispatch and conversation automation core.

pub mod api;
pub mod automation;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod store;
