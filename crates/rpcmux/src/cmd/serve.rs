use std::sync::Arc;

use rpcmux::common::{register_common_server, OperatingSystem};
use rpcmux_connection::{ConnectionConfig, ServerConnection};
use rpcmux_mux::MuxConfig;
use rpcmux_rpc::ServiceRegistry;
use rpcmux_transport::UnixSocketListener;
use tracing::{debug, info, warn};

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{rpc_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::OutputFormat;

pub async fn run(args: ServeArgs, _format: OutputFormat) -> CliResult<i32> {
    let os = args.os.map_or_else(OperatingSystem::current, Into::into);
    let registry = ServiceRegistry::new();
    register_common_server(&registry, os).map_err(|err| rpc_error("register failed", err))?;
    let registry = Arc::new(registry);

    let mut mux = MuxConfig::default().with_client_id(format!("rpcmux-serve-{}", std::process::id()));
    if let Some(idle) = &args.idle_timeout {
        mux = mux.with_idle_timeout(parse_duration(idle)?);
    }
    let config = ConnectionConfig::default().with_mux(mux);

    let listener =
        UnixSocketListener::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    info!(path = %listener.path().display(), %os, "serving");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut accepted = 0u64;

    loop {
        tokio::select! {
            driver = listener.accept() => {
                let driver = driver.map_err(|err| transport_error("accept failed", err))?;
                accepted += 1;
                let connection = ServerConnection::serve(
                    Arc::new(driver),
                    Arc::clone(&registry),
                    config.clone(),
                );
                debug!(connection = accepted, "connection accepted");
                tokio::spawn(async move {
                    let reason = connection.closed().await;
                    debug!(connection = accepted, ?reason, "connection closed");
                });
            }
            signal = &mut shutdown => {
                if let Err(err) = signal {
                    warn!(error = %err, "signal handler failed");
                    return Err(CliError::new(INTERNAL, format!("signal handler setup failed: {err}")));
                }
                info!(connections = accepted, "shutting down");
                break;
            }
        }
    }

    Ok(SUCCESS)
}
