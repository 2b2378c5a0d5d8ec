use std::{path::PathBuf, time::Duration};

use anyhow::bail;
use clap::Parser;

use crate::unit::CommandTemplate;

/// Command-line configuration for the `spara` binary.
///
/// Every option can also be set through the environment (or a `.env` file in
/// the working directory). The trailing command is run once per input line.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "spara",
    version,
    about = "Run a command once per input line on a bounded pool of workers",
    long_about = "Run a command once per input line on a bounded pool of workers.\n\n\
        `{}` in the command is replaced by the line and `{#}` by its zero-based \
        index. Without `{}` the line is appended as the last argument. The first \
        failing command stops dispatch of new lines; commands already running \
        are killed."
)]
pub struct CliArgs {
    /// Maximum number of commands running at once.
    ///
    /// Environment variable: `SPARA_JOBS`
    #[arg(short, long, env = "SPARA_JOBS", default_value_t = num_cpus::get())]
    pub jobs: usize,

    /// File with one work item per line. Reads stdin when omitted.
    ///
    /// Environment variable: `SPARA_INPUT`
    #[arg(short, long, env = "SPARA_INPUT")]
    pub input: Option<PathBuf>,

    /// Deadline for the whole run, in milliseconds.
    ///
    /// Environment variable: `SPARA_TIMEOUT_MS`
    #[arg(short, long, env = "SPARA_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// How often a running command is checked for exit and cancellation.
    ///
    /// Environment variable: `SPARA_POLL_MS`
    #[arg(long, env = "SPARA_POLL_MS", default_value_t = 10)]
    pub poll_ms: u64,

    /// Drop blank input lines instead of running the command for them.
    ///
    /// Environment variable: `SPARA_SKIP_EMPTY`
    #[arg(long, env = "SPARA_SKIP_EMPTY", default_value_t = false)]
    pub skip_empty: bool,

    /// Program and arguments to run for each item.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub jobs: usize,
    pub input: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub skip_empty: bool,
    pub command: CommandTemplate,
}

impl TryFrom<CliArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.jobs == 0 {
            bail!("SPARA_JOBS must be greater than 0");
        }

        if args.poll_ms == 0 {
            bail!("SPARA_POLL_MS must be greater than 0");
        }

        if args.timeout_ms == Some(0) {
            bail!("SPARA_TIMEOUT_MS must be greater than 0 when set");
        }

        let command = CommandTemplate::new(args.command)?;

        Ok(Self {
            jobs: args.jobs,
            input: args.input,
            timeout: args.timeout_ms.map(Duration::from_millis),
            poll_interval: Duration::from_millis(args.poll_ms),
            skip_empty: args.skip_empty,
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> anyhow::Result<RunConfig> {
        let args = CliArgs::try_parse_from(std::iter::once("spara").chain(argv.iter().copied()))?;
        RunConfig::try_from(args)
    }

    #[test]
    fn defaults() {
        let config = parse(&["echo", "{}"]).unwrap();
        assert_eq!(config.jobs, num_cpus::get());
        assert_eq!(config.input, None);
        assert_eq!(config.timeout, None);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert!(!config.skip_empty);
        assert_eq!(config.command.program(), "echo");
    }

    #[test]
    fn explicit_flags() {
        let config = parse(&[
            "-j",
            "3",
            "-i",
            "items.txt",
            "-t",
            "1500",
            "--poll-ms",
            "5",
            "--skip-empty",
            "sh",
            "-c",
            "echo {}",
        ])
        .unwrap();
        assert_eq!(config.jobs, 3);
        assert_eq!(config.input, Some(PathBuf::from("items.txt")));
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert!(config.skip_empty);
        assert_eq!(config.command.argv("x", 0), ["sh", "-c", "echo x"]);
    }

    #[test]
    fn command_keeps_its_own_flags() {
        let config = parse(&["-j", "2", "grep", "-q", "{}"]).unwrap();
        assert_eq!(config.jobs, 2);
        assert_eq!(config.command.argv("needle", 0), ["grep", "-q", "needle"]);
    }

    #[test]
    fn rejects_zero_jobs() {
        let err = parse(&["-j", "0", "true"]).unwrap_err();
        assert!(err.to_string().contains("SPARA_JOBS"));
    }

    #[test]
    fn rejects_zero_poll_and_timeout() {
        assert!(parse(&["--poll-ms", "0", "true"]).is_err());
        assert!(parse(&["-t", "0", "true"]).is_err());
    }

    #[test]
    fn requires_command() {
        assert!(CliArgs::try_parse_from(["spara", "-j", "2"]).is_err());
    }
}
