use crate::auth::Credential;
use crate::clients::ClientFactory;
use crate::config::MailConfig;
use crate::db::Database;
use crate::gmail::{MailApi, MailApiError, reply_subject};
use crate::models::{Account, GmailAutomationRule, LogStatus, MailMessage, NewLogEntry};
use crate::rules::{MailAction, MailTrigger};
use crate::sync::{SyncPlan, full_sync_query, plan_sync};
use anyhow::{Context, Result, anyhow};
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

struct ParsedRule<'a> {
    rule: &'a GmailAutomationRule,
    trigger: MailTrigger,
    action: MailAction,
}

/// Messages to evaluate plus the cursor to store once they are handled.
struct Fetched {
    message_ids: Vec<String>,
    cursor: u64,
}

/// Syncs an account's mailbox and applies its mail rules to new messages.
pub struct MailAutomation {
    db: Database,
    clients: Arc<dyn ClientFactory>,
    full_sync_window: Duration,
    max_messages: u32,
}

impl MailAutomation {
    pub fn new(db: Database, clients: Arc<dyn ClientFactory>, config: &MailConfig) -> Self {
        Self {
            db,
            clients,
            full_sync_window: Duration::days(config.full_sync_window_days.max(1)),
            max_messages: config.max_messages.max(1),
        }
    }

    pub async fn process_messages(&self, account: &Account, credential: &Credential) -> Result<()> {
        let rules = self.db.get_gmail_rules_for_account(&account.id).await?;
        if rules.is_empty() {
            debug!(account_id = %account.id, "No mail rules");
            return Ok(());
        }
        let parsed: Vec<ParsedRule> = rules.iter().filter_map(parse_rule).collect();

        let api = self
            .clients
            .mail(&credential.access_token)
            .context("Failed to build mail client")?;

        let now = Utc::now();
        let plan = plan_sync(account, now, self.full_sync_window);
        let fetched = match self.fetch(api.as_ref(), &plan).await {
            Ok(fetched) => fetched,
            Err(MailApiError::CursorInvalid) => {
                warn!(account_id = %account.id, "Mail cursor rejected, falling back to full sync");
                self.fetch(api.as_ref(), &plan.fallback(now, self.full_sync_window))
                    .await
                    .map_err(into_anyhow)?
            }
            Err(MailApiError::Other(e)) => return Err(e),
        };

        debug!(
            account_id = %account.id,
            messages = fetched.message_ids.len(),
            "Fetched mail"
        );

        for id in &fetched.message_ids {
            let msg = match api.get_message(id).await {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(account_id = %account.id, message_id = %id, error = %e, "Failed to load message");
                    continue;
                }
            };

            if let Err(e) = self.db.upsert_gmail_message(&account.id, &msg).await {
                warn!(account_id = %account.id, message_id = %id, error = %e, "Failed to store message");
            }

            // The account's own outgoing mail, including auto-replies.
            if msg.has_label("SENT") {
                continue;
            }

            for rule in &parsed {
                if rule.trigger.matches(&msg) {
                    self.apply_rule(api.as_ref(), account, &msg, rule).await;
                }
            }
        }

        self.db
            .update_sync_cursor(&account.id, &fetched.cursor.to_string(), now)
            .await?;
        Ok(())
    }

    async fn fetch(&self, api: &dyn MailApi, plan: &SyncPlan) -> Result<Fetched, MailApiError> {
        match plan {
            SyncPlan::Incremental { history_id, .. } => {
                let page = api.list_history(*history_id).await?;
                Ok(Fetched {
                    message_ids: page.message_ids,
                    cursor: page.history_id.unwrap_or(*history_id),
                })
            }
            SyncPlan::Full { since } => {
                // Baseline first, so mail arriving during the listing is replayed next time.
                let cursor = api
                    .current_history_id()
                    .await
                    .context("Failed to read mailbox cursor")?;
                let message_ids = api
                    .list_message_ids(&full_sync_query(*since), self.max_messages)
                    .await?;
                Ok(Fetched { message_ids, cursor })
            }
        }
    }

    async fn apply_rule(
        &self,
        api: &dyn MailApi,
        account: &Account,
        msg: &MailMessage,
        parsed: &ParsedRule<'_>,
    ) {
        let rule_id = parsed.rule.id.as_str();

        match self.db.has_success_log(rule_id, &msg.id).await {
            Ok(true) => {
                debug!(account_id = %account.id, rule_id, message_id = %msg.id, "Action already applied");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(account_id = %account.id, rule_id, message_id = %msg.id, error = %e, "Dedup lookup failed, retrying next cycle");
                return;
            }
        }

        let trigger_details = json!({
            "source_id": msg.id,
            "trigger": parsed.trigger.kind(),
            "from": msg.from_address,
            "subject": msg.subject,
        });

        let entry = match execute(api, msg, &parsed.action).await {
            Ok(details) => {
                info!(account_id = %account.id, rule_id, message_id = %msg.id, action = parsed.action.kind(), "Applied mail action");
                NewLogEntry {
                    account_id: account.id.clone(),
                    rule_id: Some(rule_id.to_string()),
                    status: LogStatus::Success,
                    trigger_details,
                    action_details: details,
                    error_message: None,
                }
            }
            Err(e) => {
                warn!(account_id = %account.id, rule_id, message_id = %msg.id, action = parsed.action.kind(), error = %e, "Mail action failed");
                NewLogEntry {
                    account_id: account.id.clone(),
                    rule_id: Some(rule_id.to_string()),
                    status: LogStatus::Failure,
                    trigger_details,
                    action_details: json!({ "action": parsed.action.kind() }),
                    error_message: Some(format!("{:#}", e)),
                }
            }
        };

        if let Err(e) = self.db.append_log(&entry).await {
            error!(account_id = %account.id, rule_id, error = %e, "Failed to append automation log");
        }
    }
}

async fn execute(api: &dyn MailApi, msg: &MailMessage, action: &MailAction) -> Result<Value> {
    let id = msg.id.as_str();
    match action {
        MailAction::AutoReply { body, subject } => {
            let subject = subject
                .clone()
                .unwrap_or_else(|| reply_subject(msg.subject.as_deref()));
            api.send_reply(msg, &subject, body).await?;
            return Ok(json!({
                "action": action.kind(),
                "to": msg.from_address,
                "subject": subject,
            }));
        }
        MailAction::Forward { to } => {
            return Err(anyhow!("forwarding to {} is not supported", to));
        }
        MailAction::AddLabel { label_id } => api.modify_labels(id, &[label_id.as_str()], &[]).await?,
        MailAction::RemoveLabel { label_id } => api.modify_labels(id, &[], &[label_id.as_str()]).await?,
        MailAction::MarkRead => api.mark_as_read(id).await?,
        MailAction::MarkUnread => api.mark_as_unread(id).await?,
        MailAction::Archive => api.archive_message(id).await?,
        MailAction::Trash => api.trash_message(id).await?,
        MailAction::Star => api.modify_labels(id, &["STARRED"], &[]).await?,
        MailAction::Unstar => api.modify_labels(id, &[], &["STARRED"]).await?,
    }

    let mut details = json!({ "action": action.kind() });
    if let MailAction::AddLabel { label_id } | MailAction::RemoveLabel { label_id } = action {
        details["label_id"] = json!(label_id);
    }
    Ok(details)
}

fn parse_rule(rule: &GmailAutomationRule) -> Option<ParsedRule<'_>> {
    let parsed = MailTrigger::parse(&rule.trigger_type, &rule.trigger_conditions)
        .and_then(|trigger| Ok((trigger, MailAction::parse(&rule.action_type, &rule.action_config)?)));
    match parsed {
        Ok((trigger, action)) => Some(ParsedRule {
            rule,
            trigger,
            action,
        }),
        Err(e) => {
            warn!(rule_id = %rule.id, error = %e, "Skipping malformed mail rule");
            None
        }
    }
}

fn into_anyhow(err: MailApiError) -> anyhow::Error {
    match err {
        MailApiError::Other(e) => e,
        cursor @ MailApiError::CursorInvalid => anyhow::Error::new(cursor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeClients, FakeMail, credential, message, seed_account, test_db, test_vault};

    struct Harness {
        _dir: tempfile::TempDir,
        db: Database,
        account_id: String,
        clients: FakeClients,
        automation: MailAutomation,
    }

    async fn harness(mail: FakeMail) -> Harness {
        let (dir, db) = test_db().await;
        let account_id = seed_account(&db, &test_vault(), true).await;
        let clients = FakeClients {
            mail,
            ..Default::default()
        };
        let automation = MailAutomation::new(db.clone(), Arc::new(clients.clone()), &MailConfig::default());
        Harness {
            _dir: dir,
            db,
            account_id,
            clients,
            automation,
        }
    }

    impl Harness {
        async fn account(&self) -> Account {
            self.db.get_account_by_id(&self.account_id).await.unwrap().unwrap()
        }

        async fn run(&self) {
            let account = self.account().await;
            self.automation
                .process_messages(&account, &credential())
                .await
                .unwrap();
        }
    }

    fn inbox() -> FakeMail {
        FakeMail::with_messages(
            vec![
                message("m1", "Billing <billing@vendor.com>", "Invoice #1", &["INBOX", "UNREAD"]),
                message("m2", "friend@example.com", "Lunch?", &["INBOX"]),
            ],
            500,
        )
    }

    #[tokio::test]
    async fn first_run_does_full_sync_and_stores_baseline() {
        let h = harness(inbox()).await;
        h.db.create_gmail_rule(&h.account_id, "label invoices", "subject_contains", r#"{"subject":"invoice"}"#, "add_label", r#"{"label_id":"Label_9"}"#, 0)
            .await
            .unwrap();

        h.run().await;

        {
            let state = h.clients.mail.state();
            assert_eq!(state.list_queries.len(), 1);
            assert!(state.list_queries[0].starts_with("after:"));
            assert!(state.history_calls.is_empty());
            assert_eq!(
                state.label_changes,
                vec![("m1".to_string(), vec!["Label_9".to_string()], vec![])]
            );
        }

        let account = h.account().await;
        assert_eq!(account.gmail_history_id.as_deref(), Some("500"));
        assert!(account.gmail_last_sync_at.is_some());
        assert!(h.db.get_gmail_message(&h.account_id, "m2").await.unwrap().is_some());

        let logs = h.db.list_logs(&h.account_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Success);
        assert_eq!(logs[0].action_details["label_id"], "Label_9");
    }

    #[tokio::test]
    async fn stored_cursor_drives_incremental_sync() {
        let h = harness(inbox()).await;
        h.db.create_gmail_rule(&h.account_id, "read all", "new_message", "{}", "mark_read", "{}", 0)
            .await
            .unwrap();
        h.db.update_sync_cursor(&h.account_id, "420", Utc::now()).await.unwrap();

        h.run().await;

        let state = h.clients.mail.state();
        assert_eq!(state.history_calls, vec![420]);
        assert!(state.list_queries.is_empty());
        assert_eq!(state.label_changes.len(), 2);
        drop(state);
        assert_eq!(h.account().await.gmail_history_id.as_deref(), Some("500"));
    }

    #[tokio::test]
    async fn rejected_cursor_falls_back_to_full_sync() {
        let h = harness(inbox()).await;
        h.db.create_gmail_rule(&h.account_id, "archive", "new_message", "{}", "archive", "{}", 0)
            .await
            .unwrap();
        h.db.update_sync_cursor(&h.account_id, "1", Utc::now()).await.unwrap();
        h.clients.mail.state().cursor_invalid = true;

        h.run().await;

        let state = h.clients.mail.state();
        assert_eq!(state.history_calls, vec![1]);
        assert_eq!(state.list_queries.len(), 1);
        drop(state);
        assert_eq!(h.account().await.gmail_history_id.as_deref(), Some("500"));
    }

    #[tokio::test]
    async fn auto_reply_is_sent_once_per_message() {
        let h = harness(inbox()).await;
        h.db.create_gmail_rule(&h.account_id, "ack", "sender_contains", r#"{"sender":"vendor.com"}"#, "auto_reply", r#"{"body":"Received, thanks."}"#, 0)
            .await
            .unwrap();

        h.run().await;
        h.run().await;

        let replies = h.clients.mail.state().replies.clone();
        assert_eq!(replies, vec![("m1".to_string(), "Re: Invoice #1".to_string())]);
        assert_eq!(h.db.list_logs(&h.account_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_and_unsupported_actions_are_logged() {
        let h = harness(inbox()).await;
        h.db.create_gmail_rule(&h.account_id, "fwd", "subject_contains", r#"{"subject":"lunch"}"#, "forward", r#"{"to":"boss@example.com"}"#, 5)
            .await
            .unwrap();
        h.db.create_gmail_rule(&h.account_id, "trash", "subject_contains", r#"{"subject":"invoice"}"#, "trash", "{}", 1)
            .await
            .unwrap();
        h.clients.mail.state().fail_actions = true;

        h.run().await;

        let logs = h.db.list_logs(&h.account_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.status == LogStatus::Failure));
        let errors: Vec<_> = logs.iter().filter_map(|l| l.error_message.clone()).collect();
        assert!(errors.iter().any(|e| e.contains("trash rejected")));
        assert!(errors.iter().any(|e| e.contains("not supported")));

        // failures do not count as handled
        h.clients.mail.state().fail_actions = false;
        h.run().await;
        assert_eq!(h.clients.mail.state().trashed, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn sent_messages_are_stored_but_not_evaluated() {
        let mail = FakeMail::with_messages(
            vec![message("s1", "user@example.com", "Re: Invoice #1", &["SENT"])],
            77,
        );
        let h = harness(mail).await;
        h.db.create_gmail_rule(&h.account_id, "ack", "new_message", "{}", "auto_reply", r#"{"body":"ok"}"#, 0)
            .await
            .unwrap();

        h.run().await;

        assert!(h.clients.mail.state().replies.is_empty());
        assert!(h.db.get_gmail_message(&h.account_id, "s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn no_rules_means_no_mail_calls() {
        let h = harness(inbox()).await;

        h.run().await;

        let state = h.clients.mail.state();
        assert!(state.list_queries.is_empty());
        assert!(state.history_calls.is_empty());
        drop(state);
        assert!(h.account().await.gmail_history_id.is_none());
    }

    #[tokio::test]
    async fn malformed_rule_is_skipped() {
        let h = harness(inbox()).await;
        h.db.insert_unchecked_gmail_rule(&h.account_id, "broken", "sender_contains", "archive", "{}")
            .await
            .unwrap();
        h.db.create_gmail_rule(&h.account_id, "star", "starred", "{}", "unstar", "{}", 0)
            .await
            .unwrap();
        h.db.create_gmail_rule(&h.account_id, "star invoices", "subject_contains", r#"{"subject":"invoice"}"#, "star", "{}", 0)
            .await
            .unwrap();

        h.run().await;

        let changes = h.clients.mail.state().label_changes.clone();
        assert_eq!(
            changes,
            vec![("m1".to_string(), vec!["STARRED".to_string()], vec![])]
        );
    }
}
