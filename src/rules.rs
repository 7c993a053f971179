//! Typed trigger and action payloads for automation rules.
//!
//! Rule rows store their payloads as JSON text. They are validated when a
//! rule is created and parsed again on every evaluation; a payload that no
//! longer parses disables only that rule for the cycle.

use crate::models::{CalendarEvent, MailMessage};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("malformed trigger conditions: {0}")]
    Trigger(#[source] serde_json::Error),
    #[error("malformed action payload: {0}")]
    Action(#[source] serde_json::Error),
    #[error("invalid rule: {0}")]
    Invalid(String),
}

/// Conditions for a calendar rule.
///
/// The summary condition is satisfied by an exact `summary_equals` match or by
/// any `summary_contains` substring. An empty `location_contains` list matches
/// every location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventTrigger {
    pub summary_equals: Option<String>,
    pub summary_contains: Vec<String>,
    pub location_contains: Vec<String>,
}

impl EventTrigger {
    pub fn parse(raw: &str) -> Result<Self, RuleError> {
        let mut trigger: Self = serde_json::from_str(raw).map_err(RuleError::Trigger)?;
        trigger.summary_equals = trigger
            .summary_equals
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        trigger.summary_contains = normalize_terms(trigger.summary_contains);
        trigger.location_contains = normalize_terms(trigger.location_contains);

        if !trigger.has_summary_filter() && trigger.location_contains.is_empty() {
            return Err(RuleError::Invalid(
                "trigger needs at least one summary or location condition".to_string(),
            ));
        }
        Ok(trigger)
    }

    fn has_summary_filter(&self) -> bool {
        self.summary_equals.is_some() || !self.summary_contains.is_empty()
    }

    pub fn matches(&self, event: &CalendarEvent) -> bool {
        self.summary_matches(&event.summary)
            && self.location_matches(event.location.as_deref().unwrap_or(""))
    }

    fn summary_matches(&self, summary: &str) -> bool {
        if !self.has_summary_filter() {
            return true;
        }
        if self.summary_equals.as_deref() == Some(summary.trim()) {
            return true;
        }
        let summary = summary.to_lowercase();
        self.summary_contains.iter().any(|term| summary.contains(term.as_str()))
    }

    fn location_matches(&self, location: &str) -> bool {
        if self.location_contains.is_empty() {
            return true;
        }
        let location = location.to_lowercase();
        self.location_contains.iter().any(|term| location.contains(term.as_str()))
    }
}

/// Lowercases and drops blank terms; a blank term would match everything.
fn normalize_terms(terms: Vec<String>) -> Vec<String> {
    terms
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// About five years either side of the triggering event.
pub const MAX_OFFSET_MINUTES: i64 = 5 * 366 * 24 * 60;
pub const MAX_DURATION_MINUTES: i64 = 7 * 24 * 60;

fn default_offset_minutes() -> i64 {
    -60
}

fn default_duration_minutes() -> i64 {
    5
}

/// Reminder event to create relative to the triggering event's start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderAction {
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_offset_minutes")]
    pub offset_minutes: i64,
    #[serde(default = "default_duration_minutes")]
    pub duration_minutes: i64,
}

impl ReminderAction {
    pub fn parse(raw: &str) -> Result<Self, RuleError> {
        let mut action: Self = serde_json::from_str(raw).map_err(RuleError::Action)?;
        action.title = action.title.trim().to_string();
        if action.title.is_empty() {
            return Err(RuleError::Invalid("reminder title is empty".to_string()));
        }
        if action.duration_minutes <= 0 || action.duration_minutes > MAX_DURATION_MINUTES {
            return Err(RuleError::Invalid(format!(
                "reminder duration must be between 1 and {} minutes, got {}",
                MAX_DURATION_MINUTES, action.duration_minutes
            )));
        }
        if action.offset_minutes.unsigned_abs() > MAX_OFFSET_MINUTES.unsigned_abs() {
            return Err(RuleError::Invalid(format!(
                "reminder offset must be within {} minutes, got {}",
                MAX_OFFSET_MINUTES, action.offset_minutes
            )));
        }
        Ok(action)
    }

    /// `[start + offset, start + offset + duration]`, or `None` when it falls
    /// outside the representable date range.
    pub fn window(&self, trigger_start: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = trigger_start.checked_add_signed(Duration::try_minutes(self.offset_minutes)?)?;
        let end = start.checked_add_signed(Duration::try_minutes(self.duration_minutes)?)?;
        Some((start, end))
    }
}

/// Builds `{"type": <kind>, ..payload}` so a rule's separate type column and
/// JSON payload deserialize as one internally tagged enum.
fn tagged(kind: &str, payload: &str) -> Result<Value, serde_json::Error> {
    let mut map = if payload.trim().is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(payload)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected a JSON object, got {other}"
                )));
            }
        }
    };
    map.insert("type".to_string(), Value::String(kind.to_string()));
    Ok(Value::Object(map))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), RuleError> {
    if value.trim().is_empty() {
        Err(RuleError::Invalid(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MailTrigger {
    NewMessage,
    SenderContains { sender: String },
    SubjectContains { subject: String },
    LabelPresent { label: String },
    Starred,
}

impl MailTrigger {
    pub fn parse(trigger_type: &str, conditions: &str) -> Result<Self, RuleError> {
        let value = tagged(trigger_type, conditions).map_err(RuleError::Trigger)?;
        let trigger: Self = serde_json::from_value(value).map_err(RuleError::Trigger)?;
        match &trigger {
            MailTrigger::SenderContains { sender } => require_non_empty("sender", sender)?,
            MailTrigger::SubjectContains { subject } => require_non_empty("subject", subject)?,
            MailTrigger::LabelPresent { label } => require_non_empty("label", label)?,
            MailTrigger::NewMessage | MailTrigger::Starred => {}
        }
        Ok(trigger)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MailTrigger::NewMessage => "new_message",
            MailTrigger::SenderContains { .. } => "sender_contains",
            MailTrigger::SubjectContains { .. } => "subject_contains",
            MailTrigger::LabelPresent { .. } => "label_present",
            MailTrigger::Starred => "starred",
        }
    }

    pub fn matches(&self, msg: &MailMessage) -> bool {
        match self {
            MailTrigger::NewMessage => true,
            MailTrigger::SenderContains { sender } => contains_ci(msg.from_address.as_deref(), sender),
            MailTrigger::SubjectContains { subject } => contains_ci(msg.subject.as_deref(), subject),
            MailTrigger::LabelPresent { label } => msg.has_label(label.trim()),
            MailTrigger::Starred => msg.is_starred(),
        }
    }
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack
        .map(|h| h.to_lowercase().contains(&needle.trim().to_lowercase()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MailAction {
    AutoReply {
        body: String,
        #[serde(default)]
        subject: Option<String>,
    },
    Forward {
        to: String,
    },
    AddLabel {
        #[serde(alias = "label")]
        label_id: String,
    },
    RemoveLabel {
        #[serde(alias = "label")]
        label_id: String,
    },
    MarkRead,
    MarkUnread,
    Archive,
    Trash,
    Star,
    Unstar,
}

impl MailAction {
    pub fn parse(action_type: &str, config: &str) -> Result<Self, RuleError> {
        let value = tagged(action_type, config).map_err(RuleError::Action)?;
        let action: Self = serde_json::from_value(value).map_err(RuleError::Action)?;
        match &action {
            MailAction::AutoReply { body, .. } => require_non_empty("reply body", body)?,
            MailAction::Forward { to } => require_non_empty("forward address", to)?,
            MailAction::AddLabel { label_id } | MailAction::RemoveLabel { label_id } => {
                require_non_empty("label_id", label_id)?
            }
            _ => {}
        }
        Ok(action)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MailAction::AutoReply { .. } => "auto_reply",
            MailAction::Forward { .. } => "forward",
            MailAction::AddLabel { .. } => "add_label",
            MailAction::RemoveLabel { .. } => "remove_label",
            MailAction::MarkRead => "mark_read",
            MailAction::MarkUnread => "mark_unread",
            MailAction::Archive => "archive",
            MailAction::Trash => "trash",
            MailAction::Star => "star",
            MailAction::Unstar => "unstar",
        }
    }
}
