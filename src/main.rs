use std::path::PathBuf;

use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};

use loadcontrol::auth::AuthContext;
use loadcontrol::config::{ControllerConfig, LoggingConfig};

#[derive(Parser)]
#[command(
    name = "loadcontrol",
    about = "Controller for distributed load-test jobs",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $LOADCONTROL_CONFIG, then /etc/loadcontrol/loadcontrol.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller (API server + scheduler + stall sweep)
    Serve {
        /// Bind address, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage scheduled tests
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Print the calendar (scheduled and historical tests) as JSON
    Calendar,

    /// Search stored tests by storage-folder prefix
    Search {
        /// Folder prefix, e.g. `basic/2024`
        #[arg(default_value = "")]
        prefix: String,

        /// Maximum number of results
        #[arg(long)]
        max_results: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List pending scheduled tests
    List,

    /// Remove a scheduled or historical entry
    Remove {
        /// Test id
        test_id: String,

        /// Also delete the test's stored files
        #[arg(long)]
        delete_storage: bool,
    },

    /// Preview what will launch in the next N days
    Preview {
        /// Days to preview
        #[arg(long, default_value = "7")]
        days: i64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::load_or_default(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting loadcontrol");
            loadcontrol::serve(config).await?;
        }
        Commands::Schedule { action } => {
            let controller = loadcontrol::standalone(config)?;
            let scheduler = controller.scheduler();

            match action {
                ScheduleAction::List => {
                    let list = scheduler.scheduled_tests().await?;
                    if list.is_empty() {
                        println!("No scheduled tests.");
                    } else {
                        println!("{:<40} | {:<25} | {:<10} | Owner", "Test", "Next run", "Recurring");
                        println!("{:-<40}-|-{:-<25}-|-{:-<10}-|-{:-<10}", "", "", "", "");
                        for entry in list {
                            println!(
                                "{:<40} | {:<25} | {:<10} | {}",
                                entry.test_id,
                                entry.next_run.to_rfc3339(),
                                entry.is_recurring(),
                                entry.owner.as_deref().unwrap_or("-")
                            );
                        }
                    }
                }
                ScheduleAction::Remove {
                    test_id,
                    delete_storage,
                } => {
                    scheduler
                        .remove_test(&test_id, &AuthContext::system(), delete_storage)
                        .await?;
                    println!("Removed '{}'.", test_id);
                }
                ScheduleAction::Preview { days } => {
                    let now = Utc::now();
                    let runs = scheduler.upcoming_runs(now, now + Duration::days(days)).await?;
                    if runs.is_empty() {
                        println!("No launches in the next {} days.", days);
                    } else {
                        println!("Upcoming launches (next {} days):", days);
                        for (time, test_id) in runs {
                            println!("{} : {}", time.to_rfc3339(), test_id);
                        }
                    }
                }
            }
        }
        Commands::Calendar => {
            let controller = loadcontrol::standalone(config)?;
            let events = controller.scheduler().get_calendar_events().await?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Commands::Search {
            prefix,
            max_results,
        } => {
            let controller = loadcontrol::standalone(config)?;
            let results = controller.manager().search_tests(&prefix, max_results).await?;
            if results.is_empty() {
                println!("No tests match '{}'.", prefix);
            }
            for record in results {
                println!("{:<40} | {}", record.test_id, record.storage_folder);
            }
        }
    }

    Ok(())
}
