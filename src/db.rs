use crate::models::{
    Account, AccountStatus, AutomationRule, GmailAutomationRule, LogStatus, MailMessage,
    NewAccount, NewLogEntry,
};
use crate::rules;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteJournalMode, SqliteRow};
use sqlx::{Row, sqlite::SqlitePool};
use uuid::Uuid;

const ACCOUNT_COLUMNS: &str = "id, user_id, provider, email, access_token, refresh_token, token_expiry, scopes, status, \
     gmail_sync_enabled, last_checked_at, gmail_history_id, gmail_last_sync_at";

/// Pooled SQLite handle. Cloning shares the pool, so concurrent account
/// units can read and write without extra locking.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn create_account(&self, account: &NewAccount) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO accounts (id, user_id, provider, email, access_token, refresh_token, token_expiry, scopes, \
             status, gmail_sync_enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?)",
        )
        .bind(&id)
        .bind(&account.user_id)
        .bind(&account.provider)
        .bind(&account.email)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.token_expiry)
        .bind(account.scopes.join(" "))
        .bind(account.gmail_sync_enabled)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert account")?;
        Ok(id)
    }

    pub async fn get_active_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE status = 'active' ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list active accounts")?;

        rows.iter().map(account_from_row).collect()
    }

    pub async fn get_account_by_id(&self, id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load account")?;

        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn update_credentials(
        &self,
        id: &str,
        access_token: &[u8],
        refresh_token: Option<&[u8]>,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET access_token = ?, refresh_token = ?, token_expiry = ?, updated_at = ? WHERE id = ?",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expiry)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update account credentials")?;
        Ok(())
    }

    pub async fn update_status(&self, id: &str, status: AccountStatus) -> Result<()> {
        sqlx::query("UPDATE accounts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update account status")?;
        Ok(())
    }

    pub async fn update_last_checked(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_checked_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update last checked time")?;
        Ok(())
    }

    pub async fn update_sync_cursor(
        &self,
        id: &str,
        cursor: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE accounts SET gmail_history_id = ?, gmail_last_sync_at = ? WHERE id = ?")
            .bind(cursor)
            .bind(synced_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update sync cursor")?;
        Ok(())
    }

    /// Creates a calendar rule after validating both payloads.
    pub async fn create_calendar_rule(
        &self,
        account_id: &str,
        name: &str,
        trigger_conditions: &str,
        actions: &str,
    ) -> Result<String> {
        rules::EventTrigger::parse(trigger_conditions)?;
        rules::ReminderAction::parse(actions)?;

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO automation_rules (id, account_id, name, is_active, trigger_conditions, actions, created_at)
             VALUES (?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(&id)
        .bind(account_id)
        .bind(name)
        .bind(trigger_conditions)
        .bind(actions)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert automation rule")?;
        Ok(id)
    }

    /// Creates a mail rule after validating its trigger and action payloads.
    pub async fn create_gmail_rule(
        &self,
        account_id: &str,
        name: &str,
        trigger_type: &str,
        trigger_conditions: &str,
        action_type: &str,
        action_config: &str,
        priority: i64,
    ) -> Result<String> {
        rules::MailTrigger::parse(trigger_type, trigger_conditions)?;
        rules::MailAction::parse(action_type, action_config)?;

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO gmail_automation_rules (id, account_id, name, is_active, trigger_type, trigger_conditions, \
             action_type, action_config, priority, created_at)
             VALUES (?, ?, ?, 1, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(account_id)
        .bind(name)
        .bind(trigger_type)
        .bind(trigger_conditions)
        .bind(action_type)
        .bind(action_config)
        .bind(priority)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert gmail automation rule")?;
        Ok(id)
    }

    pub async fn get_rules_for_account(&self, account_id: &str) -> Result<Vec<AutomationRule>> {
        let rows = sqlx::query(
            "SELECT id, account_id, name, is_active, trigger_conditions, actions
             FROM automation_rules
             WHERE account_id = ? AND is_active = 1
             ORDER BY created_at ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list automation rules")?;

        let rules = rows
            .into_iter()
            .map(|row| AutomationRule {
                id: row.get(0),
                account_id: row.get(1),
                name: row.get(2),
                is_active: row.get(3),
                trigger_conditions: row.get(4),
                actions: row.get(5),
            })
            .collect();

        Ok(rules)
    }

    /// Active mail rules, highest priority first.
    pub async fn get_gmail_rules_for_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<GmailAutomationRule>> {
        let rows = sqlx::query(
            "SELECT id, account_id, name, is_active, trigger_type, trigger_conditions, action_type, action_config, priority
             FROM gmail_automation_rules
             WHERE account_id = ? AND is_active = 1
             ORDER BY priority DESC, created_at ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list gmail automation rules")?;

        let rules = rows
            .into_iter()
            .map(|row| GmailAutomationRule {
                id: row.get(0),
                account_id: row.get(1),
                name: row.get(2),
                is_active: row.get(3),
                trigger_type: row.get(4),
                trigger_conditions: row.get(5),
                action_type: row.get(6),
                action_config: row.get(7),
                priority: row.get(8),
            })
            .collect();

        Ok(rules)
    }

    pub async fn has_success_log(&self, rule_id: &str, source_id: &str) -> Result<bool> {
        self.has_log_with_status(rule_id, source_id, &[LogStatus::Success])
            .await
    }

    /// True when the pair already ended in `success` or `skipped`.
    pub async fn has_handled_log(&self, rule_id: &str, source_id: &str) -> Result<bool> {
        self.has_log_with_status(rule_id, source_id, &[LogStatus::Success, LogStatus::Skipped])
            .await
    }

    async fn has_log_with_status(
        &self,
        rule_id: &str,
        source_id: &str,
        statuses: &[LogStatus],
    ) -> Result<bool> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT 1 FROM automation_logs
             WHERE rule_id = ? AND json_extract(trigger_details, '$.source_id') = ? AND status IN ({placeholders})
             LIMIT 1"
        );
        let mut query = sqlx::query(&sql).bind(rule_id).bind(source_id);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let row = query
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up automation log")?;
        Ok(row.is_some())
    }

    pub async fn append_log(&self, entry: &NewLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO automation_logs (account_id, rule_id, executed_at, status, trigger_details, action_details, error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.account_id)
        .bind(&entry.rule_id)
        .bind(Utc::now())
        .bind(entry.status.as_str())
        .bind(entry.trigger_details.to_string())
        .bind(entry.action_details.to_string())
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await
        .context("Failed to append automation log")?;
        Ok(())
    }

    pub async fn upsert_gmail_message(&self, account_id: &str, msg: &MailMessage) -> Result<()> {
        let label_ids = serde_json::to_string(&msg.label_ids)?;
        sqlx::query(
            "INSERT INTO gmail_messages (account_id, message_id, thread_id, subject, from_address, to_address, snippet, \
             is_read, is_starred, has_attachments, label_ids, internal_date, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id, message_id) DO UPDATE SET subject=excluded.subject, snippet=excluded.snippet,
             is_read=excluded.is_read, is_starred=excluded.is_starred, has_attachments=excluded.has_attachments,
             label_ids=excluded.label_ids, updated_at=excluded.updated_at",
        )
        .bind(account_id)
        .bind(&msg.id)
        .bind(&msg.thread_id)
        .bind(&msg.subject)
        .bind(&msg.from_address)
        .bind(&msg.to_address)
        .bind(&msg.snippet)
        .bind(msg.is_read())
        .bind(msg.is_starred())
        .bind(msg.has_attachments)
        .bind(label_ids)
        .bind(msg.internal_date)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to upsert gmail message")?;
        Ok(())
    }
}

#[cfg(test)]
impl Database {
    /// Stores a rule without payload validation, as rows written by older builds may be.
    pub async fn insert_unchecked_calendar_rule(
        &self,
        account_id: &str,
        name: &str,
        trigger_conditions: &str,
        actions: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO automation_rules (id, account_id, name, is_active, trigger_conditions, actions, created_at)
             VALUES (?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(name)
        .bind(trigger_conditions)
        .bind(actions)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_unchecked_gmail_rule(
        &self,
        account_id: &str,
        name: &str,
        trigger_type: &str,
        action_type: &str,
        action_config: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO gmail_automation_rules (id, account_id, name, is_active, trigger_type, trigger_conditions, \
             action_type, action_config, priority, created_at)
             VALUES (?, ?, ?, 1, ?, '{}', ?, ?, 0, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(name)
        .bind(trigger_type)
        .bind(action_type)
        .bind(action_config)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_logs(&self, account_id: &str) -> Result<Vec<crate::models::AutomationLog>> {
        let rows = sqlx::query(
            "SELECT id, account_id, rule_id, executed_at, status, trigger_details, action_details, error_message
             FROM automation_logs WHERE account_id = ? ORDER BY id ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.get(4);
                let trigger: String = row.get(5);
                let action: String = row.get(6);
                Ok(crate::models::AutomationLog {
                    id: row.get(0),
                    account_id: row.get(1),
                    rule_id: row.get(2),
                    executed_at: row.get(3),
                    status: status.parse().map_err(|e: String| anyhow!(e))?,
                    trigger_details: serde_json::from_str(&trigger)?,
                    action_details: serde_json::from_str(&action)?,
                    error_message: row.get(7),
                })
            })
            .collect()
    }

    pub async fn get_gmail_message(
        &self,
        account_id: &str,
        message_id: &str,
    ) -> Result<Option<(String, bool, Vec<String>)>> {
        let row = sqlx::query(
            "SELECT subject, is_read, label_ids FROM gmail_messages WHERE account_id = ? AND message_id = ?",
        )
        .bind(account_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let labels: String = r.get(2);
                Ok(Some((
                    r.get::<Option<String>, _>(0).unwrap_or_default(),
                    r.get(1),
                    serde_json::from_str(&labels)?,
                )))
            }
            None => Ok(None),
        }
    }
}

fn account_from_row(row: &SqliteRow) -> Result<Account> {
    let status: String = row.try_get("status")?;
    let scopes: String = row.try_get("scopes")?;
    Ok(Account {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider: row.try_get("provider")?,
        email: row.try_get("email")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        token_expiry: row.try_get("token_expiry")?,
        scopes: scopes.split_whitespace().map(str::to_string).collect(),
        status: status.parse().map_err(|e: String| anyhow!(e))?,
        gmail_sync_enabled: row.try_get("gmail_sync_enabled")?,
        last_checked_at: row.try_get("last_checked_at")?,
        gmail_history_id: row.try_get("gmail_history_id")?,
        gmail_last_sync_at: row.try_get("gmail_last_sync_at")?,
    })
}
