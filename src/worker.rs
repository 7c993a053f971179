//! Periodic scheduler driving token refresh and rule evaluation per account.
//!
//! Each tick spawns one cycle. A cycle fans out one unit per active account
//! and waits for all of them; the whole cycle runs under a deadline shorter
//! than the tick interval. Cycles are not serialized: if one overruns, the
//! next tick still starts a new cycle, and the two may race on an account's
//! last-checked and cursor columns. Both writes are last-writer-wins and the
//! evaluators dedup through the log store, so the race is tolerated.
//!
//! Cancellation reaches in-flight units as well as the tick loop. A unit that
//! is cancelled mid-refresh still lets the detached refresh task persist.

use crate::auth::{TokenError, TokenManager};
use crate::calendar_automation::CalendarAutomation;
use crate::config::WorkerConfig;
use crate::db::Database;
use crate::mail_automation::MailAutomation;
use crate::models::Account;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Worker {
    db: Database,
    tokens: Arc<TokenManager>,
    calendar: Arc<CalendarAutomation>,
    mail: Arc<MailAutomation>,
    interval: Duration,
    cycle_timeout: Duration,
    limiter: Option<Arc<Semaphore>>,
}

impl Worker {
    pub fn new(
        db: Database,
        tokens: Arc<TokenManager>,
        calendar: Arc<CalendarAutomation>,
        mail: Arc<MailAutomation>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            db,
            tokens,
            calendar,
            mail,
            interval: config.interval(),
            cycle_timeout: config.cycle_timeout(),
            limiter: config
                .max_concurrent_accounts
                .filter(|n| *n > 0)
                .map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Runs a cycle now and then on every tick until `cancel` fires.
    /// The returned handle resolves once in-flight cycles have finished.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                cycle_timeout_secs = self.cycle_timeout.as_secs(),
                "Worker started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            let mut cycles = JoinSet::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !cycles.is_empty() {
                            warn!(running = cycles.len(), "Previous cycle still running, starting another");
                        }
                        let worker = Arc::clone(&self);
                        let cancel = cancel.clone();
                        cycles.spawn(async move { worker.run_cycle(&cancel).await });
                    }
                    Some(result) = cycles.join_next(), if !cycles.is_empty() => {
                        if let Err(e) = result {
                            error!(error = %e, "Cycle task failed");
                        }
                    }
                }
            }

            info!("Worker stopping");
            while let Some(result) = cycles.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Cycle task failed");
                }
            }
            info!("Worker stopped");
        })
    }

    /// One pass over all active accounts. Returns once every unit has finished,
    /// the cycle deadline has passed, or `cancel` fires.
    pub async fn run_cycle(self: &Arc<Self>, cancel: &CancellationToken) {
        let started = Instant::now();
        let deadline = started + self.cycle_timeout;

        let accounts = match timeout_at(deadline, self.db.get_active_accounts()).await {
            Ok(Ok(accounts)) => accounts,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to list active accounts");
                return;
            }
            Err(_) => {
                error!("Listing active accounts hit the cycle deadline");
                return;
            }
        };

        if accounts.is_empty() {
            debug!("No active accounts");
            return;
        }

        let count = accounts.len();
        let mut units = JoinSet::new();
        for account in accounts {
            let worker = Arc::clone(self);
            let cancel = cancel.clone();
            units.spawn(async move {
                let account_id = account.id.clone();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(account_id = %account_id, "Account processing cancelled");
                    }
                    outcome = timeout_at(deadline, worker.run_unit(account)) => {
                        if outcome.is_err() {
                            warn!(account_id = %account_id, "Account processing hit the cycle deadline");
                        }
                    }
                }
            });
        }

        while let Some(result) = units.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Account task failed");
            }
        }

        info!(
            accounts = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cycle complete"
        );
    }

    async fn run_unit(&self, account: Account) {
        let _permit = match &self.limiter {
            Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };
        self.process_account(account).await;
    }

    async fn process_account(&self, account: Account) {
        let credential = match self.tokens.valid_credential(&account.id).await {
            Ok(credential) => credential,
            Err(TokenError::TokenRevoked) => {
                warn!(account_id = %account.id, "Account authorization revoked, skipping");
                return;
            }
            Err(e) => {
                warn!(account_id = %account.id, error = %e, "No usable credential, skipping this cycle");
                return;
            }
        };

        if let Err(e) = self.calendar.process_events(&account, &credential).await {
            error!(account_id = %account.id, error = %format!("{:#}", e), "Calendar automation failed");
        }

        if account.gmail_sync_enabled {
            if let Err(e) = self.mail.process_messages(&account, &credential).await {
                error!(account_id = %account.id, error = %format!("{:#}", e), "Mail automation failed");
            }
        }

        if let Err(e) = self.db.update_last_checked(&account.id).await {
            warn!(account_id = %account.id, error = %e, "Failed to record last check");
        }
    }
}
