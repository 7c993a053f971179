use crate::auth::Credential;
use crate::calendar::{CalendarApi, EventQuery};
use crate::clients::ClientFactory;
use crate::config::CalendarConfig;
use crate::db::Database;
use crate::models::{Account, AutomationRule, CalendarEvent, LogStatus, NewCalendarEvent, NewLogEntry};
use crate::rules::{EventTrigger, ReminderAction};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Half-width of the event listing window, in days.
const EVENT_WINDOW_DAYS: i64 = 3650;
const DUPLICATE_PADDING_MINUTES: i64 = 1;

struct ParsedRule<'a> {
    rule: &'a AutomationRule,
    trigger: EventTrigger,
    action: ReminderAction,
}

/// Creates reminder events for calendar events matching an account's rules.
pub struct CalendarAutomation {
    db: Database,
    clients: Arc<dyn ClientFactory>,
    page_size: i32,
    marker: String,
}

impl CalendarAutomation {
    pub fn new(db: Database, clients: Arc<dyn ClientFactory>, config: &CalendarConfig) -> Self {
        Self {
            db,
            clients,
            page_size: config.page_size.max(1),
            marker: config.reminder_marker.clone(),
        }
    }

    /// Fails only when the client cannot be built or rules/events cannot be listed.
    pub async fn process_events(&self, account: &Account, credential: &Credential) -> Result<()> {
        let api = self
            .clients
            .calendar(&credential.access_token)
            .context("Failed to build calendar client")?;

        let now = Utc::now();
        let window = Duration::days(EVENT_WINDOW_DAYS);
        let events = api
            .list_events(&EventQuery {
                time_min: now - window,
                time_max: now + window,
                max_results: self.page_size,
                text: None,
            })
            .await
            .context("Failed to fetch calendar events")?;

        let rules = self.db.get_rules_for_account(&account.id).await?;
        if events.is_empty() || rules.is_empty() {
            debug!(
                account_id = %account.id,
                events = events.len(),
                rules = rules.len(),
                "Nothing to evaluate"
            );
            return Ok(());
        }

        let parsed: Vec<ParsedRule> = rules.iter().filter_map(parse_rule).collect();

        for event in &events {
            if self.is_own_reminder(event) {
                debug!(account_id = %account.id, event_id = %event.id, "Skipping reminder created by automation");
                continue;
            }

            for rule in &parsed {
                if rule.trigger.matches(event) {
                    self.apply_rule(api.as_ref(), account, event, rule).await;
                }
            }
        }

        Ok(())
    }

    fn is_own_reminder(&self, event: &CalendarEvent) -> bool {
        event
            .description
            .as_deref()
            .is_some_and(|d| d.contains(&self.marker))
    }

    async fn apply_rule(
        &self,
        api: &dyn CalendarApi,
        account: &Account,
        event: &CalendarEvent,
        parsed: &ParsedRule<'_>,
    ) {
        let rule_id = parsed.rule.id.as_str();

        match self.db.has_handled_log(rule_id, &event.id).await {
            Ok(true) => {
                debug!(account_id = %account.id, rule_id, event_id = %event.id, "Already handled");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(account_id = %account.id, rule_id, event_id = %event.id, error = %e, "Dedup lookup failed, retrying next cycle");
                return;
            }
        }

        let Some(event_start) = event.start else {
            warn!(account_id = %account.id, rule_id, event_id = %event.id, "Matched event has no start time");
            return;
        };

        let Some((start, end)) = parsed.action.window(event_start) else {
            warn!(account_id = %account.id, rule_id, event_id = %event.id, "Reminder time is out of range");
            return;
        };
        let title = parsed.action.title.as_str();
        let trigger_details = json!({
            "source_id": event.id,
            "summary": event.summary,
            "start": event_start,
        });

        match find_existing(api, title, start, end).await {
            Ok(Some(existing)) => {
                debug!(account_id = %account.id, rule_id, event_id = %event.id, existing = %existing, "Reminder already exists");
                self.record(NewLogEntry {
                    account_id: account.id.clone(),
                    rule_id: Some(rule_id.to_string()),
                    status: LogStatus::Skipped,
                    trigger_details,
                    action_details: json!({ "existing_event_id": existing, "title": title }),
                    error_message: None,
                })
                .await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(account_id = %account.id, rule_id, event_id = %event.id, error = %e, "Duplicate check failed, retrying next cycle");
                return;
            }
        }

        let reminder = NewCalendarEvent {
            summary: title.to_string(),
            description: format!("{} Reminder for \"{}\"", self.marker, event.summary),
            start,
            end,
        };

        let entry = match api.insert_event(&reminder).await {
            Ok(created) => {
                info!(account_id = %account.id, rule_id, event_id = %event.id, reminder_id = %created.id, "Created reminder");
                NewLogEntry {
                    account_id: account.id.clone(),
                    rule_id: Some(rule_id.to_string()),
                    status: LogStatus::Success,
                    trigger_details,
                    action_details: json!({
                        "created_event_id": created.id,
                        "title": title,
                        "start": start,
                        "end": end,
                    }),
                    error_message: None,
                }
            }
            Err(e) => {
                warn!(account_id = %account.id, rule_id, event_id = %event.id, error = %e, "Failed to create reminder");
                NewLogEntry {
                    account_id: account.id.clone(),
                    rule_id: Some(rule_id.to_string()),
                    status: LogStatus::Failure,
                    trigger_details,
                    action_details: json!({ "title": title, "start": start, "end": end }),
                    error_message: Some(format!("{:#}", e)),
                }
            }
        };
        self.record(entry).await;
    }

    async fn record(&self, entry: NewLogEntry) {
        if let Err(e) = self.db.append_log(&entry).await {
            error!(account_id = %entry.account_id, error = %e, "Failed to append automation log");
        }
    }
}

fn parse_rule(rule: &AutomationRule) -> Option<ParsedRule<'_>> {
    let parsed = EventTrigger::parse(&rule.trigger_conditions)
        .and_then(|trigger| Ok((trigger, ReminderAction::parse(&rule.actions)?)));
    match parsed {
        Ok((trigger, action)) => Some(ParsedRule {
            rule,
            trigger,
            action,
        }),
        Err(e) => {
            warn!(rule_id = %rule.id, error = %e, "Skipping malformed calendar rule");
            None
        }
    }
}

/// Id of an event with the same title inside the padded reminder window.
async fn find_existing(
    api: &dyn CalendarApi,
    title: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Option<String>> {
    let padding = Duration::minutes(DUPLICATE_PADDING_MINUTES);
    let candidates = api
        .list_events(&EventQuery {
            time_min: start.checked_sub_signed(padding).unwrap_or(start),
            time_max: end.checked_add_signed(padding).unwrap_or(end),
            max_results: 50,
            text: Some(title.to_string()),
        })
        .await?;

    Ok(candidates
        .into_iter()
        .find(|e| e.summary.trim() == title)
        .map(|e| e.id))
}
