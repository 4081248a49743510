//! Command-line front end for `attach`.

mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DeliveryChannel, JobConfig};
use crate::engine::Job;
use crate::error::{Error, Result};
use crate::stats::JobReport;
use crate::table::ManifestTable;

pub use progress::{EventView, print_file_list, print_report};

/// Name of the job file looked up in the user config directory.
const DEFAULT_CONFIG_FILE: &str = "attach-dl/job.toml";

/// Parsed command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    /// Manifest describing the table.
    pub manifest: Option<PathBuf>,
    /// Job configuration (TOML).
    pub config: Option<PathBuf>,
    /// Output directory override.
    pub output: Option<PathBuf>,
    /// Attachment fields to download; overrides the configuration.
    pub fields: Vec<String>,
    /// Delivery channel override.
    pub channel: Option<DeliveryChannel>,
    /// Agent host override.
    pub host: Option<String>,
    /// Agent port override.
    pub port: Option<u16>,
    /// Retry failed files once after the run.
    pub retry: bool,
    /// Only list the attachments.
    pub list: bool,
    /// Only ask the agent for its version.
    pub agent_version: bool,
}

/// What the binary should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run (or list, or query the agent) with these arguments.
    Run(CliArgs),
    /// Print usage and exit.
    Help,
}

fn value<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> std::result::Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} requires a value"))
}

/// Parses command-line arguments (without the program name).
///
/// # Errors
///
/// Returns a message for unknown flags, missing values and malformed
/// numbers.
pub fn parse_args<I>(args: I) -> std::result::Result<Command, String>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-m" | "--manifest" => parsed.manifest = Some(value(&mut args, &arg)?.into()),
            "-c" | "--config" => parsed.config = Some(value(&mut args, &arg)?.into()),
            "-o" | "--output" => parsed.output = Some(value(&mut args, &arg)?.into()),
            "-f" | "--field" => parsed.fields.push(value(&mut args, &arg)?),
            "--direct" => parsed.channel = Some(DeliveryChannel::Direct),
            "--agent-link" => parsed.channel = Some(DeliveryChannel::AgentLink),
            "--agent-token" => parsed.channel = Some(DeliveryChannel::AgentToken),
            "--host" => parsed.host = Some(value(&mut args, &arg)?),
            "--port" => {
                let raw = value(&mut args, &arg)?;
                parsed.port = Some(raw.parse().map_err(|_| format!("invalid port: {raw}"))?);
            }
            "-r" | "--retry" => parsed.retry = true,
            "-l" | "--list" => parsed.list = true,
            "--agent-version" => parsed.agent_version = true,
            "-h" | "--help" => return Ok(Command::Help),
            other => return Err(format!("unknown option: {other}")),
        }
    }
    if parsed.manifest.is_none() && !parsed.agent_version {
        return Err("--manifest is required".into());
    }
    Ok(Command::Run(parsed))
}

/// Prints usage to stderr.
pub fn print_usage() {
    eprintln!("Usage: attach --manifest <file> [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -m, --manifest <FILE>  Table manifest (JSON)");
    eprintln!("  -c, --config <FILE>    Job configuration (TOML, default: ~/.config/{DEFAULT_CONFIG_FILE})");
    eprintln!("  -o, --output <DIR>     Output directory");
    eprintln!("  -f, --field <ID>       Attachment field to download (repeatable)");
    eprintln!("      --direct           Transfer in-process (default)");
    eprintln!("      --agent-link       Push temporary URLs to the local agent");
    eprintln!("      --agent-token      Push attachment tokens to the local agent");
    eprintln!("      --host <HOST>      Agent host");
    eprintln!("      --port <PORT>      Agent port");
    eprintln!("  -r, --retry            Retry failed files once after the run");
    eprintln!("  -l, --list             List attachments and exit");
    eprintln!("      --agent-version    Print the agent version and exit");
    eprintln!("  -h, --help             Show this help");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RUST_LOG               Log filter (default: info)");
}

/// Expands a leading `~` to the home directory.
fn expand_home(path: &Path) -> Result<PathBuf> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    dirs::home_dir()
        .map(|home| home.join(rest))
        .ok_or_else(|| Error::Config("could not determine home directory".into()))
}

fn load_config(args: &CliArgs) -> Result<JobConfig> {
    if let Some(path) = &args.config {
        return JobConfig::load(&expand_home(path)?);
    }
    match dirs::config_dir().map(|dir| dir.join(DEFAULT_CONFIG_FILE)) {
        Some(path) if path.is_file() => {
            log::info!("Using job configuration {}", path.display());
            JobConfig::load(&path)
        }
        _ => Ok(JobConfig::new()),
    }
}

/// Applies command-line overrides on top of the loaded configuration.
fn apply_overrides(mut config: JobConfig, args: &CliArgs, manifest: &Path) -> Result<JobConfig> {
    if let Some(output) = &args.output {
        config.transfer.output_dir = expand_home(output)?;
    }
    if !args.fields.is_empty() {
        config.attachment_fields.clone_from(&args.fields);
    }
    if let Some(channel) = args.channel {
        config.channel = channel;
    }
    if let Some(host) = &args.host {
        config.agent.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.agent.port = port;
    }
    if args.config.is_none()
        && let Some(stem) = manifest.file_stem().and_then(|s| s.to_str())
    {
        config.job_name = stem.to_string();
    }
    Ok(config)
}

async fn print_agent_version(config: &JobConfig) -> Result<()> {
    let agent = &config.agent;
    let timeout = Duration::from_millis(agent.server_info_timeout_ms);
    let version = crate::agent::query_version(&agent.host, agent.port, timeout).await?;
    println!("Agent at {}:{} is version {version}", agent.host, agent.port);
    Ok(())
}

/// Runs the command line. Returns the report of the last pass, or `None`
/// when only listing or querying the agent.
///
/// # Errors
///
/// Returns configuration and manifest errors, and job-fatal errors.
pub async fn run(args: CliArgs) -> Result<Option<JobReport>> {
    let config = load_config(&args)?;
    let Some(manifest_path) = args.manifest.as_deref() else {
        let config = apply_overrides(config, &args, Path::new(""))?;
        print_agent_version(&config).await?;
        return Ok(None);
    };
    let manifest_path = expand_home(manifest_path)?;
    let mut config = apply_overrides(config, &args, &manifest_path)?;
    if args.agent_version {
        print_agent_version(&config).await?;
        return Ok(None);
    }

    let table = Arc::new(ManifestTable::load(&manifest_path)?);
    if config.attachment_fields.is_empty() {
        config.attachment_fields = table.attachment_fields();
        log::info!("Using attachment fields: {}", config.attachment_fields.join(", "));
    }

    let job = Job::new(config, table);
    let files = job.enumerate().await?;
    print_file_list(&files);
    if args.list || files.is_empty() {
        return Ok(None);
    }

    let cancel = job.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; finishing files in flight");
            cancel.cancel();
        }
    });

    let view = EventView::new(files.len());
    let ui = tokio::spawn(view.drive(job.subscribe()));

    let mut result = job.run().await;
    if args.retry
        && let Ok(report) = &result
        && report.failed > 0
        && !report.cancelled
    {
        println!("Retrying {} failed file(s)...", report.failed);
        result = job.retry_failed().await;
    }
    drop(job);
    let _ = ui.await;

    let report = result?;
    print_report(&report);
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Command, String> {
        parse_args(args.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn parses_agent_run() {
        let Command::Run(args) = parse(&[
            "--manifest",
            "t.json",
            "--agent-token",
            "--port",
            "9000",
            "-f",
            "fldA",
            "-f",
            "fldB",
        ])
        .unwrap() else {
            panic!("expected a run");
        };
        assert_eq!(args.manifest, Some(PathBuf::from("t.json")));
        assert_eq!(args.channel, Some(DeliveryChannel::AgentToken));
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.fields, vec!["fldA", "fldB"]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&["--port", "x", "-m", "t.json"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["--output", "out"]).is_err());
        assert!(parse(&["-m"]).is_err());
        assert_eq!(parse(&["-h"]).unwrap(), Command::Help);
    }

    #[test]
    fn agent_version_needs_no_manifest() {
        assert!(matches!(parse(&["--agent-version"]).unwrap(), Command::Run(a) if a.agent_version));
    }

    #[test]
    fn overrides_win_over_config() {
        let args = CliArgs {
            output: Some("out".into()),
            fields: vec!["fldFiles".into()],
            channel: Some(DeliveryChannel::AgentLink),
            host: Some("10.0.0.2".into()),
            ..CliArgs::default()
        };
        let config = apply_overrides(JobConfig::new(), &args, Path::new("dir/photos.json")).unwrap();
        assert_eq!(config.transfer.output_dir, PathBuf::from("out"));
        assert_eq!(config.attachment_fields, vec!["fldFiles"]);
        assert_eq!(config.channel, DeliveryChannel::AgentLink);
        assert_eq!(config.agent.host, "10.0.0.2");
        assert_eq!(config.job_name, "photos");
    }

    #[test]
    fn home_is_expanded() {
        let plain = expand_home(Path::new("rel/file.json")).unwrap();
        assert_eq!(plain, PathBuf::from("rel/file.json"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/x.json")).unwrap(), home.join("x.json"));
        }
    }
}
