use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Revoked,
    Error,
    Paused,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Revoked => "revoked",
            AccountStatus::Error => "error",
            AccountStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            "error" => Ok(Self::Error),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown account status: {other}")),
        }
    }
}

/// One externally-authorized calendar/mail identity.
///
/// Token columns hold vault ciphertext, never plaintext.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub email: String,
    pub access_token: Vec<u8>,
    pub refresh_token: Option<Vec<u8>>,
    pub token_expiry: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub status: AccountStatus,
    pub gmail_sync_enabled: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub gmail_history_id: Option<String>,
    pub gmail_last_sync_at: Option<DateTime<Utc>>,
}

/// Row written by the authorization layer when an account is connected.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user_id: String,
    pub provider: String,
    pub email: String,
    pub access_token: Vec<u8>,
    pub refresh_token: Option<Vec<u8>>,
    pub token_expiry: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub gmail_sync_enabled: bool,
}

/// Calendar automation rule. Payloads are stored as JSON text and parsed by `rules`.
#[derive(Debug, Clone)]
pub struct AutomationRule {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub is_active: bool,
    pub trigger_conditions: String,
    pub actions: String,
}

#[derive(Debug, Clone)]
pub struct GmailAutomationRule {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub is_active: bool,
    pub trigger_type: String,
    pub trigger_conditions: String,
    pub action_type: String,
    pub action_config: String,
    pub priority: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Success,
    Failure,
    Skipped,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Pending => "pending",
            LogStatus::Success => "success",
            LogStatus::Failure => "failure",
            LogStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown log status: {other}")),
        }
    }
}

/// Outcome of one (account, rule, trigger) evaluation, ready to append.
///
/// `trigger_details` must carry the external item id under `source_id`;
/// the dedup lookup keys on it.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub account_id: String,
    pub rule_id: Option<String>,
    pub status: LogStatus,
    pub trigger_details: serde_json::Value,
    pub action_details: serde_json::Value,
    pub error_message: Option<String>,
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct AutomationLog {
    pub id: i64,
    pub account_id: String,
    pub rule_id: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub status: LogStatus,
    pub trigger_details: serde_json::Value,
    pub action_details: serde_json::Value,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub id: String,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCalendarEvent {
    pub summary: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailMessage {
    pub id: String,
    pub thread_id: String,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    /// RFC 822 `Message-ID` header, used to thread replies.
    pub message_id_header: Option<String>,
    pub label_ids: Vec<String>,
    pub has_attachments: bool,
    pub internal_date: i64,
}

impl MailMessage {
    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l.eq_ignore_ascii_case(label))
    }

    pub fn is_read(&self) -> bool {
        !self.has_label("UNREAD")
    }

    pub fn is_starred(&self) -> bool {
        self.has_label("STARRED")
    }
}
