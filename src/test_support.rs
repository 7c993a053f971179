//! In-memory fakes for the external collaborators, shared by unit tests.

use crate::auth::{Credential, RefreshError, RefreshedToken, TokenRefresher};
use crate::calendar::{CalendarApi, EventQuery};
use crate::clients::ClientFactory;
use crate::db::Database;
use crate::gmail::{HistoryPage, MailApi, MailApiError};
use crate::models::{CalendarEvent, MailMessage, NewAccount, NewCalendarEvent};
use crate::vault::{KEY_LEN, Vault};
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

pub async fn test_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("gpilot-test.db").display());
    let db = Database::new(&url).await.unwrap();
    db.run_migrations().await.unwrap();
    (dir, db)
}

pub fn test_vault() -> Vault {
    Vault::new(vec![7u8; KEY_LEN])
}

pub fn new_account(
    access_token: &[u8],
    refresh_token: Option<&[u8]>,
    token_expiry: DateTime<Utc>,
) -> NewAccount {
    NewAccount {
        user_id: "user-1".to_string(),
        provider: "google".to_string(),
        email: "user@example.com".to_string(),
        access_token: access_token.to_vec(),
        refresh_token: refresh_token.map(<[u8]>::to_vec),
        token_expiry,
        scopes: vec![
            "https://www.googleapis.com/auth/calendar".to_string(),
            "https://www.googleapis.com/auth/gmail.modify".to_string(),
        ],
        gmail_sync_enabled: false,
    }
}

/// Stores an account whose credential stays valid for an hour.
pub async fn seed_account(db: &Database, vault: &Vault, gmail_sync_enabled: bool) -> String {
    let refresh = vault.encrypt_str("refresh").unwrap();
    let mut account = new_account(
        &vault.encrypt_str("access").unwrap(),
        Some(refresh.as_slice()),
        Utc::now() + Duration::hours(1),
    );
    account.gmail_sync_enabled = gmail_sync_enabled;
    db.create_account(&account).await.unwrap()
}

pub fn credential() -> Credential {
    Credential {
        access_token: "access".to_string(),
        refresh_token: Some("refresh".to_string()),
        expires_at: Utc::now() + Duration::hours(1),
    }
}

pub fn event(id: &str, summary: &str, start: DateTime<Utc>) -> CalendarEvent {
    CalendarEvent {
        id: id.to_string(),
        summary: summary.to_string(),
        description: None,
        location: None,
        start: Some(start),
        end: Some(start + Duration::hours(1)),
    }
}

pub fn message(id: &str, from: &str, subject: &str, labels: &[&str]) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        thread_id: format!("thread-{id}"),
        from_address: Some(from.to_string()),
        to_address: Some("user@example.com".to_string()),
        subject: Some(subject.to_string()),
        snippet: Some(format!("{subject} ...")),
        message_id_header: Some(format!("<{id}@mail.example.com>")),
        label_ids: labels.iter().map(|l| l.to_string()).collect(),
        has_attachments: false,
        internal_date: 1_700_000_000_000,
    }
}

enum RefreshOutcome {
    Success {
        access_token: String,
        refresh_token: Option<String>,
    },
    Revoked,
    Failed(String),
    Hang,
}

pub struct FakeRefresher {
    outcome: RefreshOutcome,
    calls: AtomicUsize,
    last_refresh_token: Mutex<Option<String>>,
}

impl FakeRefresher {
    fn with(outcome: RefreshOutcome) -> Self {
        Self {
            outcome,
            calls: AtomicUsize::new(0),
            last_refresh_token: Mutex::new(None),
        }
    }

    pub fn succeeding(access_token: &str, refresh_token: Option<&str>) -> Self {
        Self::with(RefreshOutcome::Success {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(str::to_string),
        })
    }

    pub fn revoked() -> Self {
        Self::with(RefreshOutcome::Revoked)
    }

    pub fn failing(reason: &str) -> Self {
        Self::with(RefreshOutcome::Failed(reason.to_string()))
    }

    /// Never answers, like an endpoint that accepts the connection and stalls.
    pub fn hanging() -> Self {
        Self::with(RefreshOutcome::Hang)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_refresh_token(&self) -> Option<String> {
        self.last_refresh_token.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_refresh_token.lock().unwrap() = Some(refresh_token.to_string());
        match &self.outcome {
            RefreshOutcome::Success {
                access_token,
                refresh_token,
            } => Ok(RefreshedToken {
                access_token: access_token.clone(),
                refresh_token: refresh_token.clone(),
                expires_at: Utc::now() + Duration::hours(1),
            }),
            RefreshOutcome::Revoked => Err(RefreshError::Revoked("Token has been revoked.".to_string())),
            RefreshOutcome::Failed(reason) => Err(RefreshError::Failed(reason.clone())),
            RefreshOutcome::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct CalendarState {
    pub events: Vec<CalendarEvent>,
    pub inserted: Vec<NewCalendarEvent>,
    pub queries: Vec<EventQuery>,
    pub fail_list: bool,
    pub fail_insert: bool,
    /// Holds every listing call this long before answering.
    pub list_delay: Option<std::time::Duration>,
    pub completed_lists: usize,
}

/// Calendar backed by a shared event list; inserted events become visible to later queries.
#[derive(Clone, Default)]
pub struct FakeCalendar {
    state: Arc<Mutex<CalendarState>>,
}

impl FakeCalendar {
    pub fn with_events(events: Vec<CalendarEvent>) -> Self {
        let calendar = Self::default();
        calendar.state().events = events;
        calendar
    }

    pub fn state(&self) -> MutexGuard<'_, CalendarState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl CalendarApi for FakeCalendar {
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<CalendarEvent>> {
        let delay = {
            let mut state = self.state();
            state.queries.push(query.clone());
            state.list_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.completed_lists += 1;
        if state.fail_list {
            bail!("calendar unavailable");
        }
        let text = query.text.as_deref().map(str::to_lowercase);
        Ok(state
            .events
            .iter()
            .filter(|e| match (e.start, e.end.or(e.start)) {
                (Some(start), Some(end)) => start < query.time_max && end > query.time_min,
                _ => true,
            })
            .filter(|e| {
                text.as_deref()
                    .is_none_or(|t| e.summary.to_lowercase().contains(t))
            })
            .take(query.max_results.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn insert_event(&self, event: &NewCalendarEvent) -> Result<CalendarEvent> {
        let mut state = self.state();
        if state.fail_insert {
            bail!("insert rejected");
        }
        state.inserted.push(event.clone());
        let created = CalendarEvent {
            id: format!("created-{}", state.inserted.len()),
            summary: event.summary.clone(),
            description: Some(event.description.clone()),
            location: None,
            start: Some(event.start),
            end: Some(event.end),
        };
        state.events.push(created.clone());
        Ok(created)
    }
}

#[derive(Default)]
pub struct MailState {
    pub messages: Vec<MailMessage>,
    /// Message ids reported by the history endpoint.
    pub history: Vec<String>,
    pub history_id: u64,
    pub cursor_invalid: bool,
    pub fail_actions: bool,
    pub history_calls: Vec<u64>,
    pub list_queries: Vec<String>,
    pub replies: Vec<(String, String)>,
    pub label_changes: Vec<(String, Vec<String>, Vec<String>)>,
    pub trashed: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeMail {
    state: Arc<Mutex<MailState>>,
}

impl FakeMail {
    pub fn with_messages(messages: Vec<MailMessage>, history_id: u64) -> Self {
        let mail = Self::default();
        {
            let mut state = mail.state();
            state.history = messages.iter().map(|m| m.id.clone()).collect();
            state.messages = messages;
            state.history_id = history_id;
        }
        mail
    }

    pub fn state(&self) -> MutexGuard<'_, MailState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl MailApi for FakeMail {
    async fn current_history_id(&self) -> Result<u64> {
        Ok(self.state().history_id)
    }

    async fn list_history(&self, start_history_id: u64) -> Result<HistoryPage, MailApiError> {
        let mut state = self.state();
        state.history_calls.push(start_history_id);
        if state.cursor_invalid {
            return Err(MailApiError::CursorInvalid);
        }
        Ok(HistoryPage {
            message_ids: state.history.clone(),
            history_id: Some(state.history_id),
        })
    }

    async fn list_message_ids(&self, query: &str, max_results: u32) -> Result<Vec<String>> {
        let mut state = self.state();
        state.list_queries.push(query.to_string());
        Ok(state
            .messages
            .iter()
            .take(max_results as usize)
            .map(|m| m.id.clone())
            .collect())
    }

    async fn get_message(&self, id: &str) -> Result<MailMessage> {
        match self.state().messages.iter().find(|m| m.id == id) {
            Some(msg) => Ok(msg.clone()),
            None => bail!("message {id} not found"),
        }
    }

    async fn send_reply(&self, original: &MailMessage, subject: &str, _body: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_actions {
            bail!("send rejected");
        }
        state.replies.push((original.id.clone(), subject.to_string()));
        Ok(())
    }

    async fn modify_labels(&self, id: &str, add: &[&str], remove: &[&str]) -> Result<()> {
        let mut state = self.state();
        if state.fail_actions {
            bail!("modify rejected");
        }
        let to_vec = |labels: &[&str]| labels.iter().map(|l| l.to_string()).collect::<Vec<_>>();
        state.label_changes.push((id.to_string(), to_vec(add), to_vec(remove)));
        Ok(())
    }

    async fn trash_message(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_actions {
            bail!("trash rejected");
        }
        state.trashed.push(id.to_string());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeClients {
    pub calendar: FakeCalendar,
    pub mail: FakeMail,
    pub fail_setup: bool,
}

impl ClientFactory for FakeClients {
    fn calendar(&self, _access_token: &str) -> Result<Box<dyn CalendarApi>> {
        if self.fail_setup {
            bail!("cannot build calendar client");
        }
        Ok(Box::new(self.calendar.clone()))
    }

    fn mail(&self, _access_token: &str) -> Result<Box<dyn MailApi>> {
        if self.fail_setup {
            bail!("cannot build mail client");
        }
        Ok(Box::new(self.mail.clone()))
    }
}
