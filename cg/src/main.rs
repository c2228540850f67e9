//! cg - CallGroup driver
//!
//! CLI entry point for running one call group end to end.

use std::time::Duration;

use clap::{CommandFactory, Parser};
use colored::*;
use eyre::{Context, Result, eyre};
use serde::Serialize;
use tracing::{debug, info};

use callgroup::cli::{Cli, Command, OutputFormat};
use callgroup::config::Config;
use callgroup::group::{CallGroup, CallGroupConfig, CallGroupError, GroupStatus, Outcome};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre!("Failed to install subscriber: {}", e))?;

    debug!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Run {
            payloads,
            capacity,
            timeout_ms,
            leaves,
            fail,
            handler_delay_ms,
            format,
        }) => {
            let group_config = CallGroupConfig {
                capacity: capacity.unwrap_or(config.group.capacity),
                timeout_ms: timeout_ms.unwrap_or(config.group.timeout_ms),
            };
            let options = RunOptions {
                leaves,
                fail,
                handler_delay: Duration::from_millis(handler_delay_ms),
            };
            cmd_run(&group_config, payloads, options, format).await
        }
        Some(Command::Config) => cmd_config(&config),
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

struct RunOptions {
    leaves: usize,
    fail: bool,
    handler_delay: Duration,
}

/// What happened to one arrival
#[derive(Debug, Serialize)]
struct ArrivalReport {
    arrival: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ArrivalReport {
    fn new(arrival: &'static str, payload: Option<String>, outcome: Outcome<Option<usize>>) -> Self {
        match outcome {
            Ok(value) => Self {
                arrival,
                payload,
                status: "ok",
                value,
                error: None,
            },
            Err(e) => Self {
                arrival,
                payload,
                status: if e.is_capacity_exceeded() { "rejected" } else { "failed" },
                value: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Serialize)]
struct RunReport {
    group: GroupStatus,
    arrivals: Vec<ArrivalReport>,
}

async fn cmd_run(
    group_config: &CallGroupConfig,
    payloads: Vec<String>,
    options: RunOptions,
    format: OutputFormat,
) -> Result<()> {
    debug!(?group_config, payloads = payloads.len(), leaves = options.leaves, "cmd_run: called");

    let arrivals = payloads.len() + options.leaves;
    if group_config.timeout_ms == 0 && arrivals < group_config.capacity {
        return Err(eyre!(
            "{} arrival(s) can never fill capacity {} and the timeout is disabled",
            arrivals,
            group_config.capacity
        ));
    }

    let RunOptions {
        leaves,
        fail,
        handler_delay,
    } = options;

    let group = CallGroup::<String, usize>::from_config(group_config, move |batch: Vec<String>| async move {
        if !handler_delay.is_zero() {
            tokio::time::sleep(handler_delay).await;
        }
        info!(?batch, "Handling batch");
        if fail {
            return Err(eyre!("Handler failed on a batch of {}", batch.len()));
        }
        Ok(batch.len())
    })?;

    let mut tasks = Vec::with_capacity(arrivals);
    for payload in payloads {
        let group = group.clone();
        tasks.push(tokio::spawn(async move {
            let outcome = match group.join(payload.clone()) {
                Ok(pending) => pending.await.map(Some),
                Err(e) => Err(e),
            };
            ArrivalReport::new("join", Some(payload), outcome)
        }));
    }
    for _ in 0..leaves {
        let group = group.clone();
        tasks.push(tokio::spawn(async move {
            let outcome: Result<Option<usize>, CallGroupError> = group.leave().map(|_| None);
            ArrivalReport::new("leave", None, outcome)
        }));
    }

    let mut reports = Vec::with_capacity(tasks.len());
    for task in tasks {
        reports.push(task.await.context("Arrival task failed")?);
    }
    group.closed().await;

    let report = RunReport {
        group: group.status(),
        arrivals: reports,
    };
    print_report(&report, format)?;

    let unsuccessful = report.arrivals.iter().filter(|r| !r.is_ok()).count();
    if unsuccessful > 0 {
        return Err(eyre!("{} of {} arrival(s) did not succeed", unsuccessful, report.arrivals.len()));
    }
    Ok(())
}

fn print_report(report: &RunReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Text => {
            for arrival in &report.arrivals {
                let label = match &arrival.payload {
                    Some(payload) => format!("{} {}", arrival.arrival, payload),
                    None => arrival.arrival.to_string(),
                };
                match (&arrival.value, &arrival.error) {
                    (_, Some(error)) => println!("{} {} {}", "✗".red(), label, error.dimmed()),
                    (Some(value), None) => println!("{} {} -> {}", "✓".green(), label, value.to_string().cyan()),
                    (None, None) => println!("{} {}", "✓".green(), label),
                }
            }
            let status = &report.group;
            let trigger = status
                .trigger
                .map(|t| format!("{:?}", t).to_lowercase())
                .unwrap_or_else(|| "none".to_string());
            println!(
                "Group {}: {} of {} arrivals, phase {}, trigger {}",
                status.group_id.yellow(),
                status.arrivals(),
                status.capacity,
                status.phase,
                trigger
            );
        }
    }
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    debug!("cmd_config: called");
    print!("{}", config.to_yaml()?);
    Ok(())
}
