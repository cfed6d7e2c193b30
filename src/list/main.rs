use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;

use resbx::descriptor::DescriptorStore;
use resbx::reconciler::{build_overview, OverviewReport};
use resbx::runtime::{ContainerRuntime, DockerCliRuntime};
use resbx::shared::models::{SessionState, TtlStatus};
use resbx::shared::SandboxConfig;

#[derive(Parser)]
#[command(name = "resbx-list")]
#[command(about = "List research sandbox sessions and their runtime state")]
struct Args {
    /// Emit JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Refresh continuously until interrupted
    #[arg(long, conflicts_with = "json")]
    watch: bool,

    /// Refresh interval in seconds for --watch
    #[arg(long, default_value_t = 5)]
    interval: u64,

    /// Show only the raw container listing
    #[arg(long)]
    containers_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = SandboxConfig::load_or_default()?;
    let descriptors = DescriptorStore::new(config.sessions_dir.clone());
    let runtime = DockerCliRuntime::new();

    if args.containers_only {
        return print_containers(&config, &runtime).await;
    }

    if args.watch {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

        while running.load(Ordering::SeqCst) {
            let report = build_overview(&config, &descriptors, &runtime).await?;
            print!("\x1B[2J\x1B[H");
            print_table(&report);
            println!();
            println!("Refreshing every {}s, Ctrl-C to exit", args.interval);

            let mut waited = 0;
            while waited < args.interval && running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                waited += 1;
            }
        }
        return Ok(());
    }

    let report = build_overview(&config, &descriptors, &runtime).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&to_json(&report))?);
    } else {
        print_table(&report);
    }
    Ok(())
}

async fn print_containers(config: &SandboxConfig, runtime: &DockerCliRuntime) -> Result<()> {
    let prefix = format!("{}_", config.container_prefix);
    let containers = runtime.list_containers(&prefix).await?;
    if containers.is_empty() {
        println!("No session containers running");
        return Ok(());
    }
    println!("{:<45} {:<14} {:<20} PORTS", "NAME", "ID", "STATUS");
    for container in containers {
        println!(
            "{:<45} {:<14} {:<20} {}",
            container.name, container.id, container.status, container.ports
        );
    }
    Ok(())
}

fn ttl_of(report_entry: &resbx::reconciler::SessionOverview) -> TtlStatus {
    let now = Utc::now();
    let session = &report_entry.descriptor.session;
    if session.is_expired(now) {
        TtlStatus::Expired
    } else {
        TtlStatus::Remaining(session.time_remaining(now))
    }
}

fn print_table(report: &OverviewReport) {
    if report.sessions.is_empty() {
        println!("No sessions");
    } else {
        println!(
            "{:<45} {:<20} {:<8} {:<7} {:<8} TTL",
            "SESSION ID", "USERNAME", "STATE", "BACKEND", "FRONTEND"
        );
        for entry in &report.sessions {
            let session = &entry.descriptor.session;
            let container = &entry.descriptor.container_config;
            println!(
                "{:<45} {:<20} {:<8} {:<7} {:<8} {}",
                session.session_id,
                session.username,
                entry.state,
                if entry.backend_running {
                    container.backend_port.to_string()
                } else {
                    "-".to_string()
                },
                if entry.frontend_running {
                    container.frontend_port.to_string()
                } else {
                    "-".to_string()
                },
                ttl_of(entry)
            );
        }
        println!(
            "{} session(s): {} running, {} expired, {} active, {} stopped",
            report.sessions.len(),
            report.count(SessionState::Running),
            report.count(SessionState::Expired),
            report.count(SessionState::Active),
            report.count(SessionState::Stopped)
        );
    }

    if !report.orphans.is_empty() {
        println!();
        println!("Orphaned containers (no session descriptor):");
        for container in &report.orphans {
            println!("  {} ({})", container.name, container.status);
        }
    }
}

fn to_json(report: &OverviewReport) -> serde_json::Value {
    let sessions: Vec<serde_json::Value> = report
        .sessions
        .iter()
        .map(|entry| {
            let session = &entry.descriptor.session;
            let container = &entry.descriptor.container_config;
            serde_json::json!({
                "session_id": session.session_id,
                "username": session.username,
                "state": entry.state,
                "backend_running": entry.backend_running,
                "frontend_running": entry.frontend_running,
                "backend_port": container.backend_port,
                "frontend_port": container.frontend_port,
                "created_at": session.created_at,
                "expires_at": session.expires_at,
                "ttl": ttl_of(entry).to_string(),
            })
        })
        .collect();

    serde_json::json!({
        "sessions": sessions,
        "orphans": report.orphans,
    })
}
