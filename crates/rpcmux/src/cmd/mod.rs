use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use rpcmux::common::OperatingSystem;
use rpcmux_rpc::DEFAULT_RPC_PATH;

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod info;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the built-in CommonServer service on a unix socket.
    Serve(ServeArgs),
    /// Call a remote method and print the result.
    Call(CallArgs),
    /// Open a channel, ping, and print connection details.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => block_on(serve::run(args, format)),
        Command::Call(args) => block_on(call::run(args, format)),
        Command::Info(args) => block_on(info::run(args, format)),
        Command::Version(args) => version::run(args),
    }
}

fn block_on<F: Future<Output = CliResult<i32>>>(future: F) -> CliResult<i32> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("runtime setup failed: {err}")))?
        .block_on(future)
}

/// `--os` override for the served `getBackendOS`.
#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum OsArg {
    Windows,
    Linux,
    Macintosh,
}

impl From<OsArg> for OperatingSystem {
    fn from(os: OsArg) -> Self {
        match os {
            OsArg::Windows => OperatingSystem::Windows,
            OsArg::Linux => OperatingSystem::Linux,
            OsArg::Macintosh => OperatingSystem::Macintosh,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Operating system reported by getBackendOS. Default: this host.
    #[arg(long, value_enum)]
    pub os: Option<OsArg>,
    /// Close channels idle for this long (e.g. 30s).
    #[arg(long)]
    pub idle_timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Service id, e.g. CommonServerPath.
    pub service: String,
    /// Method name, e.g. getBackendOS.
    pub method: String,
    /// Arguments as JSON: an array is spread, anything else is the sole argument.
    #[arg(long)]
    pub args: Option<String>,
    /// Channel path the service is served on.
    #[arg(long, default_value = DEFAULT_RPC_PATH)]
    pub channel: String,
    /// Connect and call timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Channel path to open.
    #[arg(long, default_value = DEFAULT_RPC_PATH)]
    pub channel: String,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration(" 2 ").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn parse_duration_millis() {
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn parse_duration_invalid() {
        for bad in ["", "0s", "bad", "5m", "-1s"] {
            assert_eq!(parse_duration(bad).unwrap_err().code, USAGE, "{bad:?}");
        }
    }
}
