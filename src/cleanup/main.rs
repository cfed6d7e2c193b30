use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;

use resbx::reconciler::{SessionReaper, SweepOutcome};
use resbx::runtime::DockerCliRuntime;
use resbx::shared::{logging, SandboxConfig};

#[derive(Parser)]
#[command(name = "resbx-cleanup")]
#[command(about = "Remove expired research sandbox sessions and their data")]
struct Args {
    /// Remove one session by id, expired or not
    #[arg(long, conflicts_with = "all")]
    session: Option<String>,

    /// Remove every session and any leftover session container
    #[arg(long)]
    all: bool,

    /// Report what would be removed without touching anything
    #[arg(long)]
    dry_run: bool,

    /// List expired sessions and exit
    #[arg(long)]
    list: bool,

    /// Skip the confirmation prompt for --all
    #[arg(long, short = 'y')]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = SandboxConfig::load_or_default()?;
    let _ = logging::init_tool_logging(&config.log_dir, "resbx_cleanup");

    let runtime = Arc::new(DockerCliRuntime::new());
    let reaper = SessionReaper::new(config, runtime);

    if args.list {
        list_expired(&reaper)?;
        return Ok(());
    }

    if let Some(session_id) = &args.session {
        if args.dry_run {
            let descriptor = reaper.descriptors().load(session_id)?;
            println!(
                "Would remove session {} ({})",
                session_id, descriptor.session.username
            );
            return Ok(());
        }
        reaper.remove_by_id(session_id).await?;
        println!("Session {session_id} removed");
        return Ok(());
    }

    let outcome = if args.all {
        if !args.dry_run && !args.yes && !confirm_remove_all()? {
            println!("Aborted");
            return Ok(());
        }
        reaper.remove_all(args.dry_run).await?
    } else {
        reaper.sweep_expired(args.dry_run).await?
    };

    report(&outcome, args.dry_run);
    if !outcome.failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn list_expired(reaper: &SessionReaper) -> Result<()> {
    let now = Utc::now();
    let expired: Vec<_> = reaper
        .descriptors()
        .list()?
        .into_iter()
        .filter(|d| d.is_expired(now))
        .collect();

    if expired.is_empty() {
        println!("No expired sessions");
        return Ok(());
    }
    println!("{} expired session(s):", expired.len());
    for descriptor in expired {
        println!(
            "  {} ({}, expired {})",
            descriptor.session.session_id,
            descriptor.session.username,
            descriptor.session.expires_at.format("%Y-%m-%d %H:%M UTC")
        );
    }
    Ok(())
}

fn confirm_remove_all() -> Result<bool> {
    print!("This removes ALL sessions, their containers and data. Type 'yes' to continue: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim() == "yes")
}

fn report(outcome: &SweepOutcome, dry_run: bool) {
    let verb = if dry_run { "Would remove" } else { "Removed" };
    if outcome.removed.is_empty() && outcome.failed.is_empty() {
        println!("Nothing to clean up");
        return;
    }
    println!("{} {} session(s)", verb, outcome.removed.len());
    for session_id in &outcome.removed {
        println!("  {session_id}");
    }
    if !outcome.failed.is_empty() {
        eprintln!("Failed to remove {} session(s):", outcome.failed.len());
        for session_id in &outcome.failed {
            eprintln!("  {session_id}");
        }
    }
}
