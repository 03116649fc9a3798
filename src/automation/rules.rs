//! Auto-reply rules and the matcher that picks at most one of them.
//!
//! Evaluation order is explicit: active rules sorted by `(priority, id)`
//! ascending, first structural match wins, evaluation stops there.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ValidationError;

/// How a rule's trigger is compared against inbound text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Case-sensitive equality with the trimmed text.
    Exact,
    /// Case-insensitive substring.
    Contains,
    /// Pattern search anywhere in the text.
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Contains => "contains",
            Self::Regex => "regex",
        }
    }
}

impl FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "contains" => Ok(Self::Contains),
            "regex" => Ok(Self::Regex),
            other => Err(format!("unknown match type: {other}")),
        }
    }
}

/// A persisted auto-reply rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoReplyRule {
    /// Surrogate id; doubles as creation order for tie-breaks.
    pub id: i64,
    pub device_id: String,
    pub name: String,
    pub match_type: MatchType,
    pub trigger: String,
    pub response: String,
    /// Lower value is checked first.
    pub priority: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operator-supplied fields for creating or replacing a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    pub match_type: MatchType,
    pub trigger: String,
    pub response: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl RuleDraft {
    /// Reject drafts that could never match or would break the matcher.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: "name".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.trigger.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: "trigger".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.response.is_empty() {
            return Err(ValidationError::InvalidField {
                field: "response".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.match_type == MatchType::Regex {
            Regex::new(&self.trigger).map_err(|e| ValidationError::InvalidPattern {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Trigger prepared for repeated evaluation.
#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    /// Lowercased trigger.
    Contains(String),
    Regex(Regex),
    /// Pattern failed to compile; never matches.
    Broken,
}

impl Matcher {
    fn for_rule(rule: &AutoReplyRule) -> Self {
        match rule.match_type {
            MatchType::Exact => Self::Exact(rule.trigger.clone()),
            MatchType::Contains => Self::Contains(rule.trigger.to_lowercase()),
            MatchType::Regex => match Regex::new(&rule.trigger) {
                Ok(re) => Self::Regex(re),
                Err(e) => {
                    warn!(
                        rule_id = rule.id,
                        rule = %rule.name,
                        device_id = %rule.device_id,
                        error = %e,
                        "Skipping auto-reply rule with invalid regex"
                    );
                    Self::Broken
                }
            },
        }
    }

    fn is_match(&self, trimmed: &str, lowered: &str, raw: &str) -> bool {
        match self {
            Self::Exact(trigger) => trigger == trimmed,
            Self::Contains(trigger) => lowered.contains(trigger.as_str()),
            Self::Regex(re) => re.is_match(raw),
            Self::Broken => false,
        }
    }
}

/// A device's active rules, sorted and compiled.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<(AutoReplyRule, Matcher)>,
}

impl RuleSet {
    /// Compile a rule list. Inactive rules are dropped.
    pub fn compile(mut rules: Vec<AutoReplyRule>) -> Self {
        rules.retain(|r| r.is_active);
        rules.sort_by_key(|r| (r.priority, r.id));

        let rules = rules
            .into_iter()
            .map(|rule| {
                let matcher = Matcher::for_rule(&rule);
                (rule, matcher)
            })
            .collect();

        Self { rules }
    }

    /// First rule that matches `text`, in evaluation order.
    pub fn first_match(&self, text: &str) -> Option<&AutoReplyRule> {
        let trimmed = text.trim();
        let lowered = text.to_lowercase();

        let hit = self
            .rules
            .iter()
            .find(|(_, matcher)| matcher.is_match(trimmed, &lowered, text))
            .map(|(rule, _)| rule);

        if let Some(rule) = hit {
            debug!(
                rule_id = rule.id,
                rule = %rule.name,
                match_type = rule.match_type.as_str(),
                "Inbound text matched auto-reply rule"
            );
        }
        hit
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// One-shot matcher over an uncompiled rule list.
pub fn match_rule<'a>(rules: &'a [AutoReplyRule], text: &str) -> Option<&'a AutoReplyRule> {
    let set = RuleSet::compile(rules.to_vec());
    let id = set.first_match(text)?.id;
    rules.iter().find(|r| r.id == id)
}
