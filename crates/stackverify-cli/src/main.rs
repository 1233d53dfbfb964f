//! stackverify - convergence verification CLI
//!
//! ## Commands
//!
//! - `run`: apply and verify one or more suites, print the report and exit
//!   with its exit code
//! - `config`: print the effective configuration as TOML

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stackverify_core::telemetry::init_tracing;
use stackverify_core::{
    exit_codes, load_config, RunReport, VerifyConfig, VerifyContext, DEFAULT_CONFIG_FILE,
};
use stackverify_suites::{run_suites, Suite};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "stackverify")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Verify that applied infrastructure stacks converged", long_about = None)]
struct Cli {
    /// Config file (missing file means defaults)
    #[arg(short, long, global = true, env = "STACKVERIFY_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply and verify suites
    Run {
        /// Suite to run, repeatable (default: all, in stage order)
        #[arg(short, long = "suite")]
        suites: Vec<Suite>,

        /// Environments to verify, overriding `env_names`
        #[arg(long = "env", env = "STACKVERIFY_ENVS", value_delimiter = ',')]
        envs: Vec<String>,

        /// Tear stacks down after verifying them
        #[arg(long)]
        teardown: bool,

        /// Print the report as JSON instead of text
        #[arg(long)]
        json: bool,

        /// Also write the JSON report to this file
        #[arg(long)]
        report_json: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

struct RunArgs {
    suites: Vec<Suite>,
    envs: Vec<String>,
    teardown: bool,
    json: bool,
    report_json: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.log_json, level);

    let code = match execute(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::USAGE
        }
    };
    std::process::exit(code);
}

fn execute(cli: Cli) -> Result<i32> {
    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Config => cmd_config(&config),
        Commands::Run {
            suites,
            envs,
            teardown,
            json,
            report_json,
        } => {
            let args = RunArgs {
                suites,
                envs,
                teardown,
                json,
                report_json,
            };
            let config = apply_overrides(config, &args)?;
            let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
            runtime.block_on(cmd_run(config, args))
        }
    }
}

/// Fold CLI flags into the loaded config and re-validate it.
fn apply_overrides(mut config: VerifyConfig, args: &RunArgs) -> Result<VerifyConfig> {
    if !args.envs.is_empty() {
        config.env_names = args.envs.clone();
    }
    if args.teardown {
        config.teardown = true;
    }
    config.validate().context("Invalid configuration after CLI overrides")?;
    Ok(config)
}

fn cmd_config(config: &VerifyConfig) -> Result<i32> {
    let rendered = toml::to_string_pretty(config).context("Failed to render config")?;
    print!("{rendered}");
    Ok(exit_codes::SUCCESS)
}

async fn cmd_run(config: VerifyConfig, args: RunArgs) -> Result<i32> {
    let suites = if args.suites.is_empty() {
        Suite::ALL.to_vec()
    } else {
        args.suites
    };
    let names: Vec<String> = suites.iter().map(Suite::to_string).collect();
    info!(suites = ?names, envs = ?config.env_names, "starting verification run");

    let ctx = VerifyContext::from_config(config);
    let report = RunReport::start(&names).finish(run_suites(&ctx, &suites).await);

    if args.json {
        println!("{}", report.to_json_pretty().context("Failed to serialise report")?);
    } else {
        print!("{}", report.render_text());
    }
    if let Some(path) = &args.report_json {
        write_report(&report, path)?;
    }

    Ok(report.exit_code())
}

fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    let json = report.to_json_pretty().context("Failed to serialise report")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    info!(path = %path.display(), "report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(cli: Cli) -> RunArgs {
        match cli.command {
            Commands::Run {
                suites,
                envs,
                teardown,
                json,
                report_json,
            } => RunArgs {
                suites,
                envs,
                teardown,
                json,
                report_json,
            },
            Commands::Config => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_parses_repeated_suites() {
        let cli = Cli::try_parse_from([
            "stackverify",
            "run",
            "--suite",
            "multitenant",
            "-s",
            "standalone",
            "--env",
            "development,production",
        ])
        .expect("parse");
        let args = run_args(cli);
        assert_eq!(args.suites, vec![Suite::Multitenant, Suite::Standalone]);
        assert_eq!(args.envs, vec!["development", "production"]);
        assert!(!args.teardown);
    }

    #[test]
    fn test_unknown_suite_is_rejected() {
        let err = Cli::try_parse_from(["stackverify", "run", "--suite", "bootstrap"])
            .err()
            .expect("unknown suite");
        assert!(err.to_string().contains("unknown suite 'bootstrap'"));
    }

    #[test]
    fn test_overrides_replace_envs_and_enable_teardown() {
        let cli = Cli::try_parse_from(["stackverify", "run", "--env", "nonproduction", "--teardown"])
            .expect("parse");
        let config = apply_overrides(VerifyConfig::default(), &run_args(cli)).expect("valid");
        assert_eq!(config.env_names, vec!["nonproduction"]);
        assert!(config.teardown);
    }

    #[test]
    fn test_report_json_is_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("report.json");
        let report = RunReport::start(&[]).finish(Vec::new());
        write_report(&report, &path).expect("write");
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(parsed["run_id"], report.run_id.to_string());
    }
}
