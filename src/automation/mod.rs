//! Conversation automation: auto-reply rules, bot/handoff control and the
//! inbound message path.

pub mod conversation;
pub mod inbound;
pub mod manager;
pub mod rules;

pub use conversation::{Action, ControlState, Conversation, ConversationKey};
pub use inbound::{InboundEvent, InboundHandler};
pub use manager::ConversationManager;
pub use rules::{AutoReplyRule, MatchType, RuleDraft, RuleSet, match_rule};
