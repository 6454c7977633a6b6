mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "rpcmux", version, about = "Multiplexed RPC transport CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "RPCMUX_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_subcommand() {
        let cli = Cli::try_parse_from([
            "rpcmux",
            "call",
            "/tmp/test.sock",
            "CommonServerPath",
            "getBackendOS",
            "--args",
            "[]",
            "--timeout",
            "500ms",
        ])
        .expect("call args should parse");

        match cli.command {
            Command::Call(args) => {
                assert_eq!(args.service, "CommonServerPath");
                assert_eq!(args.method, "getBackendOS");
                assert_eq!(args.channel, rpcmux_rpc::DEFAULT_RPC_PATH);
                assert_eq!(args.args.as_deref(), Some("[]"));
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn call_requires_service_and_method() {
        let err = Cli::try_parse_from(["rpcmux", "call", "/tmp/test.sock", "CommonServerPath"])
            .expect_err("missing method should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parses_serve_with_os_override() {
        let cli = Cli::try_parse_from([
            "rpcmux",
            "--log-format",
            "json",
            "serve",
            "/tmp/test.sock",
            "--os",
            "windows",
        ])
        .expect("serve args should parse");
        assert!(matches!(
            cli.command,
            Command::Serve(cmd::ServeArgs {
                os: Some(cmd::OsArg::Windows),
                ..
            })
        ));
    }

    #[test]
    fn parses_info_subcommand() {
        let cli = Cli::try_parse_from(["rpcmux", "info", "/tmp/test.sock", "--timeout", "3s"])
            .expect("info args should parse");
        assert!(matches!(cli.command, Command::Info(_)));
    }

    #[test]
    fn rejects_unknown_format() {
        let err = Cli::try_parse_from(["rpcmux", "--format", "xml", "version"])
            .expect_err("unknown format should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }
}
