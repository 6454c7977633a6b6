use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rpcmux::common::COMMON_SERVER;
use rpcmux_mux::{Multiplexer, MuxConfig};
use rpcmux_rpc::{RpcConfig, RpcPeer, ServiceRegistry};
use rpcmux_transport::{TransportError, UnixSocketDriver};
use serde::Serialize;

use crate::cmd::{parse_duration, InfoArgs};
use crate::exit::{mux_error, transport_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{round_ms, OutputFormat};

#[derive(Serialize)]
struct InfoOutput {
    transport: &'static str,
    client_id: String,
    channel_id: String,
    channel_path: String,
    ping_latency_ms: Option<f64>,
    backend_os: Option<String>,
    connected: bool,
}

pub async fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let driver = connect_with_timeout(&args.path, timeout).await?;

    let config = MuxConfig::default().with_open_timeout(timeout);
    let client_id = config.client_id.clone();
    let (mux, _incoming) = Multiplexer::start(Arc::new(driver), config);
    let channel = mux
        .open_channel(args.channel.as_str())
        .await
        .map_err(|err| mux_error("open failed", err))?;
    let channel_id = channel.id().to_owned();

    let ping_latency_ms = mux.ping().await.ok().map(round_ms);

    let peer = RpcPeer::spawn(
        channel,
        Arc::new(ServiceRegistry::new()),
        RpcConfig::default().with_call_timeout(timeout),
    );
    let backend_os = peer
        .get_proxy(&COMMON_SERVER)
        .get_backend_os()
        .await
        .ok()
        .map(|os| os.to_string());

    let out = InfoOutput {
        transport: mux.transport_name(),
        client_id,
        channel_id,
        channel_path: args.channel,
        ping_latency_ms,
        backend_os,
        connected: true,
    };
    mux.shutdown().await;

    print_info(&out, format);
    Ok(SUCCESS)
}

async fn connect_with_timeout(path: &Path, timeout: Duration) -> CliResult<UnixSocketDriver> {
    let start = Instant::now();
    loop {
        match UnixSocketDriver::connect(path).await {
            Ok(driver) => return Ok(driver),
            Err(err) => {
                if !is_retryable_connect_error(&err) {
                    return Err(transport_error("connect failed", err));
                }
                if start.elapsed() >= timeout {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!("connect timed out after {timeout:?}"),
                    ));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

fn is_retryable_connect_error(err: &TransportError) -> bool {
    match err {
        TransportError::Connect { source, .. } => matches!(
            source.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
        ),
        _ => false,
    }
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Connection Info:");
            println!("  Transport:        {}", out.transport);
            println!("  Client ID:        {}", out.client_id);
            println!("  Channel:          {} ({})", out.channel_path, out.channel_id);
            match out.ping_latency_ms {
                Some(ms) => println!("  Ping:             {ms:.2}ms"),
                None => println!("  Ping:             unavailable"),
            }
            match &out.backend_os {
                Some(os) => println!("  Backend OS:       {os}"),
                None => println!("  Backend OS:       unavailable"),
            }
        }
        OutputFormat::Raw => {
            println!("{}", out.channel_id);
        }
    }
}
