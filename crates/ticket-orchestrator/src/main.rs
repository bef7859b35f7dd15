// ticket-orchestrator/crates/ticket-orchestrator/src/main.rs

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use ticket_orchestrator::{config::Config, daemon, run_daemon, TicketStore};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "ticket-daemon", version, about = "Ticket orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until SIGINT or SIGTERM (default)
    Run,
    /// Reset tickets and sessions orphaned by an unclean shutdown
    Recover,
    /// Print daemon status and ticket counts
    Status,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(cfg).await,
        Command::Recover => {
            ticket_orchestrator::telemetry::init_tracing();
            let report = daemon::recover(&cfg)?;
            println!(
                "Recovered {} ticket(s), marked {} session(s) stuck",
                report.tickets_reset, report.sessions_marked_stuck
            );
            Ok(())
        }
        Command::Status => {
            let store = TicketStore::open(&cfg.database_path, 1)?;
            for line in daemon::status_lines(&store)? {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
