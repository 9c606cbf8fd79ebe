use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};

use runwright::config::RunwrightConfig;
use runwright::executor::Browser;
use runwright::retry::RetryMode;
use runwright::scheduler::{NewSchedule, Scheduler, TargetSelector};

#[derive(Parser)]
#[command(
    name = "runwright",
    about = "Scheduled browser-test execution with intelligent retry",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to /etc/runwright/runwright.toml, then built-ins)
    #[arg(long, global = true, env = "RUNWRIGHT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler driver)
    Serve {
        /// Bind address, overrides [server] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Inspect scheduled runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Fail runs left pending/running by a dead orchestrator
    Sweep,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules
    List {
        /// Only schedules of this project
        #[arg(long)]
        project_id: Option<i64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Add a new schedule
    Add {
        #[arg(long)]
        project_id: i64,

        /// Schedule name
        #[arg(long)]
        name: String,

        /// Cron expression (5-field crontab or 6/7-field with seconds)
        #[arg(long)]
        cron: String,

        /// IANA timezone the expression is evaluated in
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// Comma-separated test case ids
        #[arg(long, value_delimiter = ',', conflicts_with = "tags")]
        test_case_ids: Vec<i64>,

        /// Comma-separated tags; active test cases with any of them run
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        #[arg(long)]
        browser: Option<String>,

        /// Retries after the first attempt
        #[arg(long, default_value = "0")]
        retry_max: u32,

        /// simple or intelligent
        #[arg(long, default_value = "simple", value_parser = parse_retry_mode)]
        retry_mode: RetryMode,

        /// Comma-separated notification channel ids
        #[arg(long, value_delimiter = ',')]
        channels: Vec<i64>,

        /// Create the schedule disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Remove a schedule
    Remove {
        #[arg(long)]
        id: i64,
    },

    /// Enable a schedule; the next fire is computed from its last run
    Enable {
        #[arg(long)]
        id: i64,
    },

    /// Disable a schedule
    Disable {
        #[arg(long)]
        id: i64,
    },

    /// Fire a schedule now and wait for the run to finish
    Trigger {
        #[arg(long)]
        id: i64,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List recent scheduled runs
    List {
        #[arg(long)]
        schedule_id: Option<i64>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

fn parse_retry_mode(raw: &str) -> Result<RetryMode, String> {
    RetryMode::parse(raw).ok_or_else(|| format!("unknown retry mode '{raw}' (expected simple or intelligent)"))
}

fn init_tracing(config: &RunwrightConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn fmt_time(at: Option<chrono::DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%SZ").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Config loading logs before the configured subscriber exists.
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
        .with_writer(std::io::stderr)
        .finish();
    let mut config = tracing::subscriber::with_default(bootstrap, || match &cli.config {
        Some(path) => RunwrightConfig::load(path),
        None => Ok(RunwrightConfig::load_or_default()),
    })?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting Runwright daemon");
            runwright::serve(config).await?;
        }
        Commands::Schedule { action } => {
            let pool = runwright::storage::open_pool(&config.database.path)?;
            let scheduler = Scheduler::new(pool);

            match action {
                ScheduleAction::List { project_id, json } => {
                    let list = scheduler.list(project_id).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&list)?);
                    } else if list.is_empty() {
                        println!("No schedules found.");
                    } else {
                        println!(
                            "{:<5} | {:<20} | {:<15} | {:<18} | {:<7} | Next run",
                            "Id", "Name", "Cron", "Timezone", "Enabled"
                        );
                        println!("{:-<5}-|-{:-<20}-|-{:-<15}-|-{:-<18}-|-{:-<7}-|-{:-<20}", "", "", "", "", "", "");
                        for s in list {
                            println!(
                                "{:<5} | {:<20} | {:<15} | {:<18} | {:<7} | {}",
                                s.id,
                                s.name,
                                s.cron_expression,
                                s.timezone,
                                s.enabled,
                                fmt_time(s.next_run_at)
                            );
                        }
                    }
                }
                ScheduleAction::Add {
                    project_id,
                    name,
                    cron,
                    timezone,
                    test_case_ids,
                    tags,
                    browser,
                    retry_max,
                    retry_mode,
                    channels,
                    disabled,
                } => {
                    let target = if test_case_ids.is_empty() {
                        TargetSelector::Tags { tags }
                    } else {
                        TargetSelector::TestCaseIds { ids: test_case_ids }
                    };
                    let schedule = scheduler
                        .add(
                            NewSchedule {
                                project_id,
                                name,
                                description: None,
                                cron_expression: cron,
                                timezone,
                                target,
                                browser: browser.map(Browser::new),
                                retry_max,
                                retry_mode,
                                enabled: !disabled,
                                notification_channel_ids: channels,
                            },
                            Utc::now(),
                        )
                        .await?;
                    println!(
                        "Schedule '{}' added (id {}), next run {}.",
                        schedule.name,
                        schedule.id,
                        fmt_time(schedule.next_run_at)
                    );
                }
                ScheduleAction::Remove { id } => {
                    scheduler.remove(id).await?;
                    println!("Schedule {} removed.", id);
                }
                ScheduleAction::Enable { id } => {
                    let s = scheduler.set_enabled(id, true, Utc::now()).await?;
                    println!("Schedule {} enabled, next run {}.", id, fmt_time(s.next_run_at));
                }
                ScheduleAction::Disable { id } => {
                    scheduler.set_enabled(id, false, Utc::now()).await?;
                    println!("Schedule {} disabled.", id);
                }
                ScheduleAction::Trigger { id } => {
                    let app = runwright::build(&config)?;
                    let run = app.coordinator.trigger(&scheduler, id).await?;
                    println!(
                        "Run {} ({}): {} -- {} passed, {} failed of {}",
                        run.id,
                        run.thread_id,
                        run.status.as_str(),
                        run.pass_count,
                        run.fail_count,
                        run.test_count
                    );
                    if !run.notification_errors.is_empty() {
                        for (channel, error) in &run.notification_errors {
                            println!("  channel {}: {}", channel, error);
                        }
                    }
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview(hours, Utc::now()).await?;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for entry in preview {
                            println!("{} : {} (schedule {})", fmt_time(Some(entry.at)), entry.name, entry.schedule_id);
                        }
                    }
                }
            }
        }
        Commands::Runs { action } => {
            let pool = runwright::storage::open_pool(&config.database.path)?;
            match action {
                RunsAction::List { schedule_id, limit } => {
                    let runs = runwright::runs::store::list_runs(&pool, schedule_id, limit).await?;
                    if runs.is_empty() {
                        println!("No runs found.");
                    } else {
                        println!(
                            "{:<6} | {:<8} | {:<10} | {:<11} | {:<20} | Reason",
                            "Run", "Schedule", "Status", "Pass/Fail", "Completed"
                        );
                        println!("{:-<6}-|-{:-<8}-|-{:-<10}-|-{:-<11}-|-{:-<20}-|-{:-<20}", "", "", "", "", "", "");
                        for r in runs {
                            println!(
                                "{:<6} | {:<8} | {:<10} | {:<11} | {:<20} | {}",
                                r.id,
                                r.schedule_id,
                                r.status.as_str(),
                                format!("{}/{}", r.pass_count, r.fail_count),
                                fmt_time(r.completed_at),
                                r.status_reason.as_deref().unwrap_or("")
                            );
                        }
                    }
                }
            }
        }
        Commands::Sweep => {
            let pool = runwright::storage::open_pool(&config.database.path)?;
            let report =
                runwright::runs::recovery::sweep(&pool, config.scheduler.liveness_threshold(), Utc::now()).await?;
            println!(
                "Marked {} run(s) and {} test run(s) failed.",
                report.runs.len(),
                report.test_runs
            );
        }
    }

    Ok(())
}
