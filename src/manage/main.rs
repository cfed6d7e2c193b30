use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use resbx::orchestrator::{LogTarget, SessionOrchestrator};
use resbx::runtime::DockerCliRuntime;
use resbx::shared::models::{ProcessStatus, TtlStatus};
use resbx::shared::{logging, SandboxConfig};

#[derive(Parser)]
#[command(name = "resbx-manage")]
#[command(about = "Manage the lifecycle of research sandbox sessions")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a session's runtime pair
    Start { session_id: String },
    /// Stop a session's runtime pair
    Stop { session_id: String },
    /// Stop, settle, and start again
    Restart { session_id: String },
    /// Extend the session's lifetime past its current expiry
    Extend {
        session_id: String,
        /// Hours to add
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Issue a bearer token for the session, expiring with its TTL
    Token { session_id: String },
    /// Report process status, backend reachability and remaining TTL
    Health { session_id: String },
    /// Print recent runtime logs
    Logs {
        session_id: String,
        #[arg(long, value_enum, default_value_t = Service::Both)]
        service: Service,
        #[arg(long, default_value_t = 50)]
        tail: u32,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Service {
    Backend,
    Frontend,
    Both,
}

impl From<Service> for LogTarget {
    fn from(service: Service) -> Self {
        match service {
            Service::Backend => LogTarget::Backend,
            Service::Frontend => LogTarget::Frontend,
            Service::Both => LogTarget::Both,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = SandboxConfig::load_or_default()?;
    let _ = logging::init_tool_logging(&config.log_dir, "resbx_manage");

    let runtime = Arc::new(DockerCliRuntime::new());
    let orchestrator = SessionOrchestrator::new(config, runtime);

    match args.command {
        Command::Start { session_id } => {
            orchestrator.start(&session_id).await?;
            println!("Session {session_id} started");
        }
        Command::Stop { session_id } => {
            orchestrator.stop(&session_id).await?;
            println!("Session {session_id} stopped");
        }
        Command::Restart { session_id } => {
            orchestrator.restart(&session_id).await?;
            println!("Session {session_id} restarted");
        }
        Command::Extend { session_id, hours } => {
            let descriptor = orchestrator.extend_ttl(&session_id, hours)?;
            println!(
                "Session {session_id} extended by {hours}h, now expires {}",
                descriptor.session.expires_at.format("%Y-%m-%d %H:%M UTC")
            );
        }
        Command::Token { session_id } => {
            let token = orchestrator.issue_token(&session_id)?;
            println!("{token}");
        }
        Command::Health { session_id } => {
            let report = orchestrator.health(&session_id).await?;
            let reachability = match report.backend_reachable {
                Some(true) => " (reachable)",
                Some(false) => " (unreachable)",
                None => "",
            };
            println!("Session {}", report.session_id);
            println!(
                "  Backend:  {} on port {}{}",
                report.backend, report.backend_port, reachability
            );
            println!(
                "  Frontend: {} on port {}",
                report.frontend, report.frontend_port
            );
            println!("  TTL:      {}", report.ttl);
            println!("  Access:   http://localhost:{}", report.frontend_port);
            println!("  API:      http://localhost:{}", report.backend_port);

            let healthy = report.backend == ProcessStatus::Running
                && report.backend_reachable == Some(true)
                && matches!(report.ttl, TtlStatus::Remaining(_));
            if !healthy {
                std::process::exit(1);
            }
        }
        Command::Logs {
            session_id,
            service,
            tail,
        } => {
            for (name, text) in orchestrator
                .logs(&session_id, service.into(), tail)
                .await?
            {
                println!("==== {name} ====");
                println!("{text}");
            }
        }
    }

    Ok(())
}
