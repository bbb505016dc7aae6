//! teller-app: log in and walk through the account history.
//!
//! Lists every account with its recent operations and their fiscal receipts,
//! then the brokerage accounts and their operations.
//!
//!   TELLER_PHONE=+7... TELLER_PASSWORD=... cargo run -p teller-app
//!
//! The session is kept in `TELLER_SESSIONS_FILE` between runs, so the
//! one-time code is only asked for on the first run (or after the provider
//! dropped the session).

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use clap::Parser;
use teller_client::dto::common::{OperationsIn, ShoppingReceiptIn};
use teller_client::dto::invest::InvestOperationsIn;
use teller_client::{
    CancellationToken, Client, Config, ConfirmationProvider, Credential, ExchangeError, JsonFileStorage,
};

#[derive(Parser)]
#[command(name = "teller-app")]
#[command(about = "Dump accounts, operations, receipts and brokerage operations")]
struct Cli {
    /// Account phone number; also keys the stored session.
    #[arg(long, env = "TELLER_PHONE")]
    phone: String,

    #[arg(long, env = "TELLER_PASSWORD", hide_env_values = true)]
    password: String,

    /// Where sessions are kept between runs.
    #[arg(long, env = "TELLER_SESSIONS_FILE", default_value = "teller-sessions.json")]
    sessions_file: String,

    /// How many days of history to fetch.
    #[arg(long, default_value_t = 30)]
    days: i64,

    /// Stop after this many receipts (they are rate limited).
    #[arg(long, default_value_t = 10)]
    max_receipts: usize,

    /// Log in through a local Chrome instead of the API.
    #[cfg(feature = "chrome")]
    #[arg(long, env = "TELLER_BROWSER")]
    browser: bool,

    /// Show the Chrome window during a browser login.
    #[cfg(feature = "chrome")]
    #[arg(long)]
    headed: bool,
}

// ─── Confirmation code from stdin ─────────────────────────────────────────────

struct StdinCode;

#[async_trait]
impl ConfirmationProvider for StdinCode {
    async fn confirmation_code(&self, phone: &str) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let prompt = format!("Code sent to {phone}: ");
        let code = tokio::task::spawn_blocking(move || read_line(&prompt)).await??;
        let code = code.trim().to_string();
        if code.is_empty() {
            return Err("no code entered".into());
        }
        Ok(code)
    }
}

fn read_line(prompt: &str) -> io::Result<String> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // RUST_LOG overrides, e.g. RUST_LOG=teller_client=debug
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("teller_client=info,teller_app=info"),
    ).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        if e.is_cancelled() {
            eprintln!("\n✗ interrupted");
        } else {
            eprintln!("\n✗ {e}");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ExchangeError> {
    let config = Config::new(
        Credential::new(cli.phone.clone(), cli.password.clone()),
        Arc::new(StdinCode),
        Arc::new(JsonFileStorage::new(&cli.sessions_file)),
    );

    #[cfg(feature = "chrome")]
    let config = if cli.browser {
        let launcher = teller_client::ChromeLauncher { headless: !cli.headed, ..Default::default() };
        config.auth_flow(teller_client::AuthFlow::Browser(
            teller_client::BrowserAuthConfig::new(Arc::new(launcher)),
        ))
    } else {
        config
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let client = Client::connect(config).await?.with_cancellation(cancel);

    let since = Utc::now() - Duration::days(cli.days);
    let mut receipts = 0;

    // ── Accounts, operations, receipts ─────────────────────────────────────
    for account in client.accounts_light_ib().await? {
        if account.hidden {
            continue;
        }
        println!("\n■ {} [{}] {}", account.name, account.account_type, account.id);

        let operations = client.operations(&OperationsIn::new(account.id.clone(), since)).await?;
        println!("  {} operations since {}", operations.len(), since.format("%Y-%m-%d"));

        for op in &operations {
            println!(
                "  {}  {:>12.2} {:<4} {}",
                op.operation_time.time().format("%Y-%m-%d %H:%M"),
                op.amount.value,
                op.amount.currency.name,
                op.description,
            );

            if !op.has_shopping_receipt || receipts >= cli.max_receipts {
                continue;
            }
            receipts += 1;
            if let Some(r) = client.shopping_receipt(&ShoppingReceiptIn::for_operation(op)).await? {
                for item in &r.receipt.items {
                    println!("      · {} × {} = {:.2}", item.name, item.quantity, item.sum);
                }
            }
        }
    }

    // ── Brokerage ──────────────────────────────────────────────────────────
    let invest = client.invest_accounts("RUB").await?;
    println!("\n■ Brokerage: {} accounts", invest.accounts.count);
    for account in &invest.accounts.list {
        println!(
            "  {} [{}] {:.2} {}",
            account.name,
            account.broker_account_type,
            account.totals.total_amount.value,
            account.totals.total_amount.currency,
        );

        let query = InvestOperationsIn {
            from:              Some(since),
            to:                Some(Utc::now()),
            broker_account_id: Some(account.broker_account_id.clone()),
            ..Default::default()
        };
        let mut iter = client.iter_invest_operations(query);
        while let Some(op) = iter.next(&client).await? {
            println!("    {}  {:<24} {:>12.2} {}", op.date, op.description, op.payment.value, op.payment.currency);
        }
    }

    client.close();
    Ok(())
}
