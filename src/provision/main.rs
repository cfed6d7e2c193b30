use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use resbx::orchestrator::{ProvisionedSession, SessionOrchestrator};
use resbx::runtime::DockerCliRuntime;
use resbx::shared::{logging, SandboxConfig};

#[derive(Parser)]
#[command(name = "resbx-provision")]
#[command(about = "Provision isolated research sandbox sessions")]
struct Args {
    /// Number of sessions to provision
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Write the credential blocks to this file as well as stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Append to the output file instead of overwriting it
    #[arg(long)]
    append: bool,

    /// Override the configured sessions directory
    #[arg(long, env = "RESBX_SESSIONS_DIR")]
    sessions_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = SandboxConfig::load_or_default()?;
    if let Some(dir) = &args.sessions_dir {
        config.sessions_dir = dir.clone();
    }
    let _ = logging::init_tool_logging(&config.log_dir, "resbx_provision");

    let runtime = Arc::new(DockerCliRuntime::new());
    let orchestrator = SessionOrchestrator::new(config, runtime);
    let mut state = orchestrator.allocation_state().await?;

    let mut provisioned: Vec<ProvisionedSession> = Vec::new();
    let mut failures = 0u32;
    for index in 1..=args.count {
        match orchestrator.provision_one(&mut state).await {
            Ok(session) => {
                println!("{}", credential_block(&session, index, args.count));
                provisioned.push(session);
            }
            Err(e) => {
                eprintln!("Session {}/{} failed: {}", index, args.count, e);
                failures += 1;
            }
        }
    }

    if let Some(path) = &args.output {
        if !provisioned.is_empty() {
            write_credentials_file(path, args.append, &provisioned, args.count)?;
            println!("Credentials written to {} (plaintext, distribute and delete)", path.display());
        }
    }

    println!(
        "Provisioned {} of {} session(s)",
        provisioned.len(),
        args.count
    );
    if !provisioned.is_empty() {
        println!();
        println!("Next steps:");
        println!("  - Hand each credential block to exactly one researcher");
        println!("  - Check health:     resbx-manage health <session-id>");
        println!("  - List sessions:    resbx-list");
        println!("  - Expired cleanup:  resbx-cleanup");
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn credential_block(session: &ProvisionedSession, index: u32, total: u32) -> String {
    let container = &session.descriptor.container_config;
    let credentials = &session.credentials;
    format!(
        "============================================================\n\
         Session {index} of {total}\n\
         ============================================================\n\
         \x20 Session ID: {}\n\
         \x20 Username:   {}\n\
         \x20 Password:   {}\n\
         \x20 Backend:    http://localhost:{}\n\
         \x20 Frontend:   http://localhost:{}\n\
         \x20 Expires:    {} ({}h)\n",
        credentials.session_id,
        credentials.username,
        credentials.password,
        container.backend_port,
        container.frontend_port,
        credentials.expires_at.format("%Y-%m-%d %H:%M UTC"),
        session.descriptor.session.ttl_hours,
    )
}

fn write_credentials_file(
    path: &PathBuf,
    append: bool,
    sessions: &[ProvisionedSession],
    total: u32,
) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(append)
        .write(true)
        .truncate(!append)
        .open(path)?;
    for (i, session) in sessions.iter().enumerate() {
        writeln!(file, "{}", credential_block(session, i as u32 + 1, total))?;
    }
    Ok(())
}
