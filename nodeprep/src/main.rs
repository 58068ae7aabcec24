//! nodeprep - provision or tear down a GPU cluster node

use anyhow::{Context, Result};
use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::Parser;
use nodeprep::capabilities::Capabilities;
use nodeprep::config::NodeprepConfig;
use nodeprep::events::LoggingEventSink;
use nodeprep::observability::init_tracing;
use nodeprep::persist;
use nodeprep::provisioning::{build_pipeline, Mode};
use nodeprep::report::{ExecutionReport, RunResult, EXIT_ABORTED};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug, Default)]
#[command(
    name = "nodeprep",
    version,
    about = "Provision a host as an accelerator-enabled cluster node"
)]
struct Cli {
    /// Run the forward install pipeline
    #[arg(long, conflicts_with = "cleanup")]
    install: bool,

    /// Run the best-effort teardown pipeline
    #[arg(long)]
    cleanup: bool,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the run result as JSON
    #[arg(long, value_name = "FILE")]
    report_json: Option<PathBuf>,

    /// Print the stage list and exit
    #[arg(long)]
    plan: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.cleanup {
            Mode::Cleanup
        } else if self.install {
            Mode::Install {
                check_privileges: false,
            }
        } else {
            Mode::implicit()
        }
    }
}

const MODE_FLAGS: [&str; 2] = ["--install", "--cleanup"];

/// Parses the command line, dropping whatever clap rejects.
///
/// Unknown tokens are removed and the rest is parsed again, so recognized
/// flags survive. Conflicting mode flags are both dropped, which leaves the
/// implicit install. Help and version requests come back as `Err`.
fn parse_args<I, T>(args: I) -> Result<(Cli, Vec<clap::Error>), clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let mut rejected = Vec::new();

    loop {
        let err = match Cli::try_parse_from(args.clone()) {
            Ok(cli) => return Ok((cli, rejected)),
            Err(err) => err,
        };

        let dropped = match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => return Err(err),
            ErrorKind::UnknownArgument => {
                invalid_arg(&err).is_some_and(|token| drop_tokens(&mut args, &[token.as_str()]))
            }
            ErrorKind::ArgumentConflict => drop_tokens(&mut args, &MODE_FLAGS),
            _ => false,
        };

        rejected.push(err);
        if !dropped {
            return Ok((Cli::default(), rejected));
        }
    }
}

fn invalid_arg(err: &clap::Error) -> Option<String> {
    match err.get(ContextKind::InvalidArg) {
        Some(ContextValue::String(token)) => Some(token.clone()),
        _ => None,
    }
}

/// Removes every argument equal to one of `tokens`, or of the form
/// `token=value`. The program name is never touched.
fn drop_tokens(args: &mut Vec<OsString>, tokens: &[&str]) -> bool {
    let before = args.len();
    let mut index = 0;
    args.retain(|arg| {
        index += 1;
        if index == 1 {
            return true;
        }
        let arg = arg.to_string_lossy();
        !tokens.iter().any(|token| {
            arg == *token
                || arg
                    .strip_prefix(token)
                    .is_some_and(|rest| rest.starts_with('='))
        })
    });
    args.len() < before
}

fn write_report(path: &Path, result: &RunResult) -> Result<()> {
    let json = serde_json::to_vec_pretty(result).context("serializing run report")?;
    persist::write_atomic(path, &json)
        .with_context(|| format!("writing run report to {}", path.display()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let (cli, rejected) = match parse_args(std::env::args_os()) {
        Ok(parsed) => parsed,
        Err(err) => err.exit(),
    };

    init_tracing(cli.verbose)?;
    for err in &rejected {
        let reason = err.render().to_string();
        warn!(
            reason = %reason.lines().next().unwrap_or_default(),
            mode = ?cli.mode(),
            "Ignoring unrecognized arguments"
        );
    }

    let config = match NodeprepConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Could not load configuration");
            std::process::exit(EXIT_ABORTED);
        }
    };

    let caps = match Capabilities::system(&config) {
        Ok(caps) => caps,
        Err(err) => {
            error!(error = %err, "Could not initialise system backends");
            std::process::exit(EXIT_ABORTED);
        }
    };

    let mode = cli.mode();
    let pipeline = match build_pipeline(mode, &config, &caps, Arc::new(LoggingEventSink::default())) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!(error = %err, "Could not build pipeline");
            std::process::exit(EXIT_ABORTED);
        }
    };

    if cli.plan {
        println!("{}:", pipeline.name());
        for entry in pipeline.plan() {
            println!("  {entry}");
        }
        return Ok(());
    }

    info!(pipeline = %pipeline.name(), stages = pipeline.stages().len(), "Starting");
    let result = pipeline.run().await;
    let report = ExecutionReport::new(&result);
    print!("{}", report.render());

    if let Some(path) = &cli.report_json {
        if let Err(err) = write_report(path, &result) {
            warn!(error = %format!("{err:#}"), "Could not write JSON report");
        }
    }

    std::process::exit(report.exit_code());
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> (Cli, Vec<ErrorKind>) {
        let (cli, rejected) = parse_args(args.iter().copied()).unwrap();
        (cli, rejected.iter().map(|err| err.kind()).collect())
    }

    #[test]
    fn test_no_arguments_is_implicit_install() {
        let (cli, rejected) = parse(&["nodeprep"]);
        assert!(rejected.is_empty());
        assert_eq!(cli.mode(), Mode::implicit());
    }

    #[test]
    fn test_explicit_modes() {
        let (cli, _) = parse(&["nodeprep", "--install"]);
        assert_eq!(
            cli.mode(),
            Mode::Install {
                check_privileges: false
            }
        );

        let (cli, _) = parse(&["nodeprep", "--cleanup", "-v"]);
        assert_eq!(cli.mode(), Mode::Cleanup);
        assert!(cli.verbose);
    }

    #[test]
    fn test_unrecognized_argument_falls_back() {
        let (cli, rejected) = parse(&["nodeprep", "--frobnicate"]);
        assert_eq!(rejected, vec![ErrorKind::UnknownArgument]);
        assert_eq!(cli.mode(), Mode::implicit());
    }

    #[test]
    fn test_unrecognized_argument_keeps_requested_mode() {
        let (cli, rejected) = parse(&[
            "nodeprep",
            "--cleanup",
            "--config",
            "/etc/np.toml",
            "--frobnicate",
        ]);
        assert_eq!(rejected, vec![ErrorKind::UnknownArgument]);
        assert_eq!(cli.mode(), Mode::Cleanup);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/np.toml")));
    }

    #[test]
    fn test_every_unrecognized_argument_is_dropped() {
        let (cli, rejected) = parse(&[
            "nodeprep",
            "--typo",
            "-v",
            "--install",
            "--other=1",
            "--report-json",
            "/tmp/run.json",
        ]);
        assert_eq!(rejected.len(), 2);
        assert_eq!(
            cli.mode(),
            Mode::Install {
                check_privileges: false
            }
        );
        assert!(cli.verbose);
        assert_eq!(cli.report_json, Some(PathBuf::from("/tmp/run.json")));
    }

    #[test]
    fn test_help_is_reported_not_run() {
        let err = parse_args(["nodeprep", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_install_and_cleanup_conflict() {
        let (cli, rejected) = parse(&[
            "nodeprep",
            "--install",
            "--cleanup",
            "--config",
            "/etc/np.toml",
        ]);
        assert_eq!(rejected, vec![ErrorKind::ArgumentConflict]);
        assert_eq!(cli.mode(), Mode::implicit());
        assert_eq!(cli.config, Some(PathBuf::from("/etc/np.toml")));
    }

    #[test]
    fn test_report_json_path() {
        let (cli, _) = parse(&["nodeprep", "--report-json", "/tmp/run.json", "--plan"]);
        assert_eq!(cli.report_json, Some(PathBuf::from("/tmp/run.json")));
        assert!(cli.plan);
    }
}
