use sqlx::Row;
use sqlx::sqlite::SqlitePoolOptions;
use std::env;

const DEFAULT_LIMIT: i64 = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <account_id> [limit]", args[0]);
        eprintln!("Prints the most recent automation log entries for an account.");
        std::process::exit(1);
    }

    let account_id = &args[1];
    let limit = match args.get(2) {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|e| anyhow::anyhow!("Invalid limit {:?}: {}", raw, e))?,
        None => DEFAULT_LIMIT,
    };

    let database_url =
        env::var("GPILOT_DATABASE_URL").unwrap_or_else(|_| "sqlite://gpilot.db".to_string());
    let pool = SqlitePoolOptions::new()
        .connect(&database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let account = sqlx::query("SELECT email, status, last_checked_at, gmail_history_id FROM accounts WHERE id = ?")
        .bind(account_id)
        .fetch_optional(&pool)
        .await?;

    let Some(account) = account else {
        println!("No account with id {}", account_id);
        return Ok(());
    };

    let email: String = account.get("email");
    let status: String = account.get("status");
    let last_checked: Option<String> = account.get("last_checked_at");
    let cursor: Option<String> = account.get("gmail_history_id");
    println!("Account: {} ({})", email, status);
    println!("Last checked: {}", last_checked.as_deref().unwrap_or("never"));
    println!("Mail cursor: {}", cursor.as_deref().unwrap_or("none"));
    println!(
        "--------------------------------------------------------------------------------"
    );

    let rows = sqlx::query(
        "SELECT executed_at, status, rule_id, trigger_details, action_details, error_message
         FROM automation_logs
         WHERE account_id = ?
         ORDER BY id DESC
         LIMIT ?",
    )
    .bind(account_id)
    .bind(limit)
    .fetch_all(&pool)
    .await?;

    if rows.is_empty() {
        println!("No automation logs.");
        return Ok(());
    }

    for row in rows {
        let executed_at: String = row.get("executed_at");
        let status: String = row.get("status");
        let rule_id: Option<String> = row.get("rule_id");
        let trigger: String = row.get("trigger_details");
        let action: String = row.get("action_details");
        let error: Option<String> = row.get("error_message");

        let source = serde_json::from_str::<serde_json::Value>(&trigger)
            .ok()
            .and_then(|v| v.get("source_id").and_then(|s| s.as_str()).map(str::to_string))
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{} [{}] rule={} source={}",
            executed_at,
            status,
            rule_id.as_deref().unwrap_or("-"),
            source
        );
        println!("    action: {}", action);
        if let Some(error) = error {
            println!("    error: {}", error);
        }
    }

    Ok(())
}
