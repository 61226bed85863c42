//! `delve` developer harness
//!
//! - `validate` checks a planner reply and prints the resulting plan
//! - `simulate` runs a scripted scenario through the orchestrator

mod scenario;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use delve_core::OrchestratorConfig;
use delve_plan::{PlanBuilder, PlanProposal};
use scenario::{Scenario, SimulationReport};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit code for a rejected plan
const EXIT_PLAN_INVALID: u8 = 2;
/// Exit code for a scenario left waiting on clarification
const EXIT_UNANSWERED: u8 = 3;

fn cli() -> Command {
    Command::new("delve")
        .version(delve_core::VERSION)
        .about("Plan execution core developer harness")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Orchestrator configuration (TOML)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("validate")
                .about("Validate a planner reply and print the plan")
                .arg(
                    Arg::new("proposal")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Planner reply: JSON, optionally inside a code fence"),
                )
                .arg(
                    Arg::new("question")
                        .long("question")
                        .default_value("")
                        .help("Question the plan answers, used for complexity signals"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a scripted scenario through the orchestrator")
                .arg(
                    Arg::new("scenario")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Scenario file (TOML)"),
                )
                .arg(
                    Arg::new("termination-threshold")
                        .long("termination-threshold")
                        .value_parser(value_parser!(usize))
                        .help("Synthesis output length that ends a plan early"),
                )
                .arg(
                    Arg::new("max-rounds")
                        .long("max-rounds")
                        .value_parser(value_parser!(u32))
                        .help("Clarification rounds before lenient defaults"),
                )
                .arg(
                    Arg::new("max-concurrency")
                        .long("max-concurrency")
                        .value_parser(value_parser!(usize))
                        .help("Steps running at once"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<OrchestratorConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(OrchestratorConfig::new()),
    }
}

fn validate(config: &OrchestratorConfig, args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let Some(path) = args.get_one::<PathBuf>("proposal") else {
        anyhow::bail!("missing proposal path");
    };
    let question = args.get_one::<String>("question").map_or("", String::as_str);
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading proposal from {}", path.display()))?;
    let proposal = PlanProposal::from_planner_text(&text).context("parsing planner reply")?;

    let builder = PlanBuilder::new().with_caps(config.plan.caps);
    match builder.build(question, None, Some(proposal)) {
        Ok(plan) => {
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::error!(reason = err.tag(), "plan rejected");
            eprintln!("plan invalid: {err}");
            Ok(ExitCode::from(EXIT_PLAN_INVALID))
        }
    }
}

/// Command-line settings win over the config file
fn with_overrides(mut config: OrchestratorConfig, args: &ArgMatches) -> OrchestratorConfig {
    if let Some(&chars) = args.get_one::<usize>("termination-threshold") {
        config = config.with_termination_threshold(chars);
    }
    if let Some(&rounds) = args.get_one::<u32>("max-rounds") {
        config = config.with_max_rounds(rounds);
    }
    if let Some(&max) = args.get_one::<usize>("max-concurrency") {
        config = config.with_max_concurrency(max);
    }
    config
}

async fn simulate(config: OrchestratorConfig, args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let Some(path) = args.get_one::<PathBuf>("scenario") else {
        anyhow::bail!("missing scenario path");
    };
    let scenario = Scenario::from_file(path)
        .with_context(|| format!("loading scenario from {}", path.display()))?;

    let report = scenario.run(with_overrides(config, args)).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(match report {
        SimulationReport::Answer { .. } => ExitCode::SUCCESS,
        SimulationReport::Unanswered { .. } => ExitCode::from(EXIT_UNANSWERED),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));
    let config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("validate", args)) => validate(&config, args),
        Some(("simulate", args)) => simulate(config, args).await,
        _ => unreachable!("subcommand is required"),
    }
}
