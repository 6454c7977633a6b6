use std::sync::Arc;
use std::time::{Duration, Instant};

use rpcmux_connection::{
    ConnectionConfig, ConnectionManager, ReconnectConfig, UnixSocketConnector,
};
use rpcmux_rpc::{RpcConfig, ServiceRegistry};
use serde_json::Value;

use crate::cmd::{parse_duration, CallArgs};
use crate::exit::{connection_error, rpc_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_call, round_ms, CallReport, OutputFormat};

pub async fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let call_args = parse_args(args.args.as_deref())?;

    let manager = connect(&args, timeout).await?;
    let started = Instant::now();
    let outcome = manager
        .call(&args.channel, &args.service, &args.method, call_args)
        .await;
    let elapsed = started.elapsed();
    manager.dispose().await;

    let result = outcome.map_err(|err| rpc_error("call failed", err))?;
    print_call(
        &CallReport {
            service: &args.service,
            method: &args.method,
            channel: &args.channel,
            elapsed_ms: round_ms(elapsed),
            result: &result,
        },
        format,
    );
    Ok(SUCCESS)
}

/// Dial until connected or `timeout` elapses.
async fn connect(args: &CallArgs, timeout: Duration) -> CliResult<ConnectionManager> {
    let config = ConnectionConfig::default()
        .with_rpc(RpcConfig::default().with_call_timeout(timeout))
        .with_reconnect(
            ReconnectConfig::default()
                .with_initial_delay(Duration::from_millis(25))
                .with_max_delay(Duration::from_millis(250))
                .with_max_attempts(None),
        );
    let manager = ConnectionManager::new(
        UnixSocketConnector::new(&args.path),
        Arc::new(ServiceRegistry::new()),
        config,
    );

    match tokio::time::timeout(timeout, manager.connect()).await {
        Ok(Ok(())) => Ok(manager),
        Ok(Err(err)) => Err(connection_error("connect failed", err)),
        Err(_) => {
            manager.dispose().await;
            Err(CliError::new(
                TIMEOUT,
                format!("connect timed out after {timeout:?}"),
            ))
        }
    }
}

fn parse_args(input: Option<&str>) -> CliResult<Vec<Value>> {
    let Some(input) = input else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<Value>(input) {
        Ok(Value::Array(args)) => Ok(args),
        Ok(value) => Ok(vec![value]),
        Err(err) => Err(CliError::new(
            USAGE,
            format!("--args is not valid JSON: {err}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn arrays_are_spread() {
        assert_eq!(parse_args(Some("[1, \"two\"]")).unwrap(), vec![json!(1), json!("two")]);
        assert_eq!(parse_args(Some("[]")).unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn scalars_are_the_sole_argument() {
        assert_eq!(parse_args(Some("\"hi\"")).unwrap(), vec![json!("hi")]);
        assert_eq!(parse_args(Some("{\"a\":1}")).unwrap(), vec![json!({"a": 1})]);
        assert!(parse_args(None).unwrap().is_empty());
    }

    #[test]
    fn invalid_json_is_a_usage_error() {
        assert_eq!(parse_args(Some("{nope")).unwrap_err().code, USAGE);
    }
}
