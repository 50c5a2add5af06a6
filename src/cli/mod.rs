use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::application::{
    AppError, BillSummary, IdentityProvider, LiveAggregate, SqliteLedger, StaticIdentity, User,
};
use crate::domain::{BillRole, format_amount, parse_amount, share_of};

/// Splitbill - shared expenses between friends
#[derive(Parser)]
#[command(name = "splitbill")]
#[command(about = "Record bills, split them with friends and follow who owes what")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "SPLITBILL_DATABASE", default_value = "splitbill.db")]
    pub database: String,

    /// Signed-in user id
    #[arg(short, long, env = "SPLITBILL_USER")]
    pub user: Option<String>,

    /// Display name of the signed-in user (defaults to the user id)
    #[arg(short, long, env = "SPLITBILL_NAME")]
    pub name: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Friend list management commands
    #[command(subcommand)]
    Friend(FriendCommands),

    /// Bill management commands
    #[command(subcommand)]
    Bill(BillCommands),

    /// Show what you paid and owe in a month
    Summary {
        /// Month (YYYY-MM, defaults to the current month)
        #[arg(short, long)]
        month: Option<String>,
    },

    /// Follow the monthly summary live until interrupted
    Watch {
        /// Month (YYYY-MM, defaults to the current month)
        #[arg(short, long)]
        month: Option<String>,
    },

    /// Show notifications sent to you
    Inbox,

    /// Export a month's bills to CSV or JSON
    Export {
        /// Month (YYYY-MM, defaults to the current month)
        #[arg(short, long)]
        month: Option<String>,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,

        /// Format: csv, json
        #[arg(short, long, default_value = "csv")]
        format: String,
    },
}

#[derive(Subcommand)]
pub enum FriendCommands {
    /// Add (or rename) a friend
    Add {
        /// Friend's user id
        id: String,

        /// Name shown on bills
        name: String,
    },

    /// List your friends
    List,
}

#[derive(Subcommand)]
pub enum BillCommands {
    /// Record a new bill
    Add {
        /// Total amount (e.g., "90.00" or "90")
        amount: String,

        /// What the bill was for
        #[arg(short, long)]
        description: String,

        /// Friends to split with (repeat or comma-separate)
        #[arg(short, long, value_delimiter = ',')]
        split: Vec<String>,
    },

    /// List bills you created or were split into
    List {
        /// Month (YYYY-MM, defaults to the current month)
        #[arg(short, long)]
        month: Option<String>,
    },

    /// Show detailed bill information
    Show {
        /// Bill ID
        id: String,
    },

    /// Flip a bill between pending and paid
    ToggleStatus {
        /// Bill ID
        id: String,
    },

    /// Flip one participant between paid and unpaid
    TogglePaid {
        /// Bill ID
        id: String,

        /// Participant user id
        participant: String,
    },

    /// Delete a bill you created
    Delete {
        /// Bill ID
        id: String,
    },
}

impl Cli {
    fn init_tracing(&self) {
        let default_level = if self.verbose { "debug" } else { "warn" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("splitbill={default_level}")));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }

    fn identity(&self) -> Arc<dyn IdentityProvider> {
        match &self.user {
            Some(id) => {
                let name = self.name.clone().unwrap_or_else(|| id.clone());
                Arc::new(StaticIdentity::signed_in(User::new(id.clone(), name)))
            }
            None => Arc::new(StaticIdentity::signed_out()),
        }
    }

    async fn connect(&self) -> Result<SqliteLedger> {
        SqliteLedger::connect(&self.database, self.identity())
            .await
            .with_context(|| format!("Failed to open database: {}", self.database))
    }

    pub async fn run(self) -> Result<()> {
        self.init_tracing();

        if matches!(self.command, Commands::Init) {
            SqliteLedger::init(&self.database, self.identity()).await?;
            println!("Database initialized: {}", self.database);
            return Ok(());
        }

        let ledger = self.connect().await?;
        ledger
            .current_user()
            .context("No user given. Pass --user or set SPLITBILL_USER")?;

        let result = match self.command {
            Commands::Init => Ok(()),
            Commands::Friend(cmd) => run_friend_command(&ledger, cmd).await,
            Commands::Bill(cmd) => run_bill_command(&ledger, cmd).await,
            Commands::Summary { month } => run_summary_command(&ledger, month.as_deref()).await,
            Commands::Watch { month } => run_watch_command(&ledger, month.as_deref()).await,
            Commands::Inbox => run_inbox_command(&ledger).await,
            Commands::Export {
                month,
                output,
                format,
            } => run_export_command(&ledger, month.as_deref(), output.as_deref(), &format).await,
        };

        ledger.flush_notifications().await;
        ledger.sign_out().await;

        if let Err(err) = &result {
            if err.downcast_ref::<AppError>().is_some_and(AppError::is_retryable) {
                eprintln!("The database is busy, try again.");
            }
        }
        result
    }
}

async fn run_friend_command(ledger: &SqliteLedger, cmd: FriendCommands) -> Result<()> {
    match cmd {
        FriendCommands::Add { id, name } => {
            let friend = ledger.add_friend(&id, &name).await?;
            println!("Added friend: {} ({})", friend.name, friend.id);
        }

        FriendCommands::List => {
            let friends = ledger.candidate_participants().await?;
            if friends.is_empty() {
                println!("No friends found.");
            } else {
                println!("{:<20} NAME", "ID");
                println!("{}", "-".repeat(44));
                for friend in friends {
                    println!("{:<20} {}", friend.id, friend.name);
                }
            }
        }
    }
    Ok(())
}

async fn run_bill_command(ledger: &SqliteLedger, cmd: BillCommands) -> Result<()> {
    match cmd {
        BillCommands::Add {
            amount,
            description,
            split,
        } => {
            let amount = parse_amount(&amount).context("Invalid amount format. Use '90.00' or '90'")?;
            let bill = ledger
                .create_bill_with_friends(amount, &description, &split)
                .await?;
            let share = share_of(&bill)?;

            println!(
                "Recorded bill: {} {} ({})",
                format_amount(bill.amount),
                bill.description,
                bill.id
            );
            if bill.is_split() {
                let names: Vec<&str> = bill
                    .split_participants
                    .iter()
                    .map(|p| p.participant_name.as_str())
                    .collect();
                println!("Split with {}: {} each", names.join(", "), format_amount(share));
            }
        }

        BillCommands::List { month } => {
            let (year, month) = parse_month(month.as_deref())?;
            ledger.sign_in().await?;
            ledger.settled_view().await?;
            let bills = ledger.bills_for_month(year, month).await?;
            print_bill_table(&bills);
        }

        BillCommands::Show { id } => {
            let bill = ledger.get_bill(parse_bill_id(&id)?).await?;
            let share = share_of(&bill)?;

            println!("Bill: {}", bill.id);
            println!("  Description: {}", bill.description);
            println!("  Amount:      {}", format_amount(bill.amount));
            println!("  Created by:  {}", bill.creator_id);
            println!("  Status:      {}", bill.status);
            println!(
                "  Created:     {}",
                bill.created_at.format("%Y-%m-%d %H:%M:%S")
            );
            println!(
                "  Updated:     {}",
                bill.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
            if bill.is_split() {
                println!();
                println!("  Share:       {}", format_amount(share));
                println!("  Participants:");
                for participant in &bill.split_participants {
                    let paid = if bill.is_participant_paid(&participant.participant_id) {
                        "paid"
                    } else {
                        "owing"
                    };
                    println!(
                        "    - {} ({}) {}",
                        participant.participant_name, participant.participant_id, paid
                    );
                }
            }
        }

        BillCommands::ToggleStatus { id } => {
            let bill = ledger.toggle_status(parse_bill_id(&id)?).await?;
            println!("Bill {} is now {}", bill.id, bill.status);
        }

        BillCommands::TogglePaid { id, participant } => {
            let bill = ledger
                .toggle_participant_paid(parse_bill_id(&id)?, &participant)
                .await?;
            let state = if bill.is_participant_paid(&participant) {
                "paid"
            } else {
                "unpaid"
            };
            println!("Marked {} as {} on bill {}", participant, state, bill.id);
        }

        BillCommands::Delete { id } => {
            let bill_id = parse_bill_id(&id)?;
            let user = ledger.current_user()?;
            ledger.delete_bill(bill_id, &user.id).await?;
            println!("Deleted bill: {}", bill_id);
        }
    }
    Ok(())
}

fn print_bill_table(bills: &[BillSummary]) {
    if bills.is_empty() {
        println!("No bills found.");
        return;
    }

    println!(
        "{:<12} {:>10} {:>10} {:<9} {:<8} {:<15} DESCRIPTION",
        "DATE", "AMOUNT", "SHARE", "ROLE", "STATUS", "CREATOR"
    );
    println!("{}", "-".repeat(80));
    for summary in bills {
        let bill = &summary.bill;
        let role = match summary.role {
            BillRole::Creator => "creator",
            BillRole::Participant { paid: true } => "paid",
            BillRole::Participant { paid: false } => "owing",
        };
        println!(
            "{:<12} {:>10} {:>10} {:<9} {:<8} {:<15} {}",
            bill.created_at.format("%Y-%m-%d").to_string(),
            format_amount(bill.amount),
            format_amount(summary.share),
            role,
            bill.status.as_str(),
            truncate(&bill.creator_id, 15),
            truncate(&bill.description, 30)
        );
    }
}

async fn run_summary_command(ledger: &SqliteLedger, month: Option<&str>) -> Result<()> {
    let (year, month) = parse_month(month)?;
    let user = ledger.sign_in().await?;
    ledger.settled_view().await?;

    let live = ledger.monthly_aggregate(&user.id, year, month).await?;
    print_summary(year, month, &live);
    Ok(())
}

async fn run_watch_command(ledger: &SqliteLedger, month: Option<&str>) -> Result<()> {
    let (year, month) = parse_month(month)?;
    let user = ledger.sign_in().await?;
    let mut stream = ledger.live_aggregate(&user.id, year, month).await?;

    eprintln!("Watching {:04}-{:02}, press Ctrl-C to stop", year, month);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = stream.next() => match next {
                Some(live) => {
                    print_summary(year, month, &live);
                    println!();
                }
                None => break,
            },
        }
    }
    Ok(())
}

fn print_summary(year: i32, month: u32, live: &LiveAggregate) {
    let aggregate = &live.aggregate;
    println!("Summary for {:04}-{:02}", year, month);
    println!("  {:<10} {:>12}", "Total:", format_amount(aggregate.monthly_total));
    println!("  {:<10} {:>12}", "Paid:", format_amount(aggregate.amount_paid_by_user));
    println!("  {:<10} {:>12}", "Owed:", format_amount(aggregate.amount_owed_by_user));
    if live.possibly_incomplete {
        println!("  (some bills may be missing, a feed is not live)");
    }
}

async fn run_inbox_command(ledger: &SqliteLedger) -> Result<()> {
    let entries = ledger.inbox().await?;
    if entries.is_empty() {
        println!("Inbox is empty.");
        return Ok(());
    }

    println!("{:<20} {:<15} MESSAGE", "DATE", "FROM");
    println!("{}", "-".repeat(70));
    for entry in entries {
        println!(
            "{:<20} {:<15} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            truncate(&entry.notification.sender_id, 15),
            entry.notification.message
        );
    }
    Ok(())
}

async fn run_export_command(
    ledger: &SqliteLedger,
    month: Option<&str>,
    output: Option<&str>,
    format: &str,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{Write, stdout};

    let (year, month) = parse_month(month)?;
    ledger.sign_in().await?;
    let exporter = Exporter::new(ledger);

    // Determine output writer
    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    match format {
        "csv" => {
            let count = exporter.export_bills_csv(writer, year, month).await?;
            if output.is_some() {
                eprintln!("Exported {} bills", count);
            }
        }
        "json" => {
            let snapshot = exporter.export_month_json(writer, year, month).await?;
            if output.is_some() {
                eprintln!(
                    "Exported {:04}-{:02}: {} bills",
                    snapshot.year,
                    snapshot.month,
                    snapshot.bills.len()
                );
            }
        }
        _ => {
            anyhow::bail!("Invalid export format '{}'. Valid formats: csv, json", format);
        }
    }

    Ok(())
}

fn parse_bill_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).context("Invalid bill ID format (expected UUID)")
}

/// Parse `YYYY-MM`, defaulting to the current UTC month.
fn parse_month(month: Option<&str>) -> Result<(i32, u32)> {
    let Some(month) = month else {
        let now = Utc::now();
        return Ok((now.year(), now.month()));
    };

    let (year, month_part) = month
        .split_once('-')
        .context("Month must be in YYYY-MM format")?;
    let year: i32 = year.parse().context("Month must be in YYYY-MM format")?;
    let month: u32 = month_part
        .parse()
        .context("Month must be in YYYY-MM format")?;
    if !(1..=12).contains(&month) {
        anyhow::bail!("Month must be between 01 and 12");
    }
    Ok((year, month))
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
