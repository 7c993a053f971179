//! Calendar and mail automation for connected Google accounts.
//!
//! A [`worker::Worker`] polls every active account on a fixed interval. For
//! each one it obtains a valid credential through [`auth::TokenManager`],
//! runs the calendar and mail rule evaluators, and records every outcome in
//! the `automation_logs` table, which doubles as the dedup store.

pub mod auth;
pub mod calendar;
pub mod calendar_automation;
pub mod clients;
pub mod config;
pub mod db;
pub mod gmail;
pub mod mail_automation;
pub mod models;
pub mod rules;
pub mod sync;
#[cfg(test)]
mod test_support;
pub mod vault;
pub mod worker;
