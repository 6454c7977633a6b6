use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use rpcmux_mux::{Channel, ChannelEvent, IncomingChannels, Multiplexer, MuxConfig, MuxRole};
use rpcmux_rpc::{
    error_to_arg, Envelope, ErrorArg, FromProxy, ProxyIdentifier, RemoteProxy, RpcConfig,
    RpcError, RpcPeer, SerializedError, Service, ServiceRegistry, DEFAULT_RPC_PATH,
    HANDLER_PANIC, INVALID_ARGUMENTS,
};
use rpcmux_transport::MemoryDriver;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum OperatingSystem {
    Windows,
    Linux,
    Macintosh,
}

struct CommonServerClient(RemoteProxy);

impl FromProxy for CommonServerClient {
    fn from_proxy(proxy: RemoteProxy) -> Self {
        Self(proxy)
    }
}

impl CommonServerClient {
    async fn get_backend_os(&self) -> Result<OperatingSystem, RpcError> {
        self.0.invoke("getBackendOS", vec![]).await
    }
}

const COMMON_SERVER: ProxyIdentifier<CommonServerClient> =
    ProxyIdentifier::new("CommonServerPath");

struct Harness {
    client: RpcPeer,
    server: RpcPeer,
    driver: Arc<MemoryDriver>,
    _muxes: (Multiplexer, Multiplexer),
}

async fn open_pair() -> (Channel, Channel, Arc<MemoryDriver>, Multiplexer, Multiplexer, IncomingChannels) {
    let (left, right) = MemoryDriver::pair();
    let left = Arc::new(left);
    let (client_mux, client_incoming) =
        Multiplexer::start(left.clone(), MuxConfig::default().with_client_id("client"));
    let (server_mux, mut server_incoming) = Multiplexer::start(
        Arc::new(right),
        MuxConfig::default()
            .with_client_id("server")
            .with_role(MuxRole::Acceptor),
    );

    let local = client_mux.open_channel(DEFAULT_RPC_PATH).await.unwrap();
    let remote = timeout(WAIT, server_incoming.accept())
        .await
        .unwrap()
        .unwrap();
    (local, remote, left, client_mux, server_mux, client_incoming)
}

async fn harness(server_registry: ServiceRegistry, client_config: RpcConfig) -> Harness {
    harness_with(server_registry, ServiceRegistry::new(), client_config).await
}

async fn harness_with(
    server_registry: ServiceRegistry,
    client_registry: ServiceRegistry,
    client_config: RpcConfig,
) -> Harness {
    let (local, remote, driver, client_mux, server_mux, _incoming) = open_pair().await;
    let server = RpcPeer::spawn(remote, Arc::new(server_registry), RpcConfig::default());
    let client = RpcPeer::spawn(local, Arc::new(client_registry), client_config);
    Harness {
        client,
        server,
        driver,
        _muxes: (client_mux, server_mux),
    }
}

/// Reports when a running handler is dropped (completed or aborted).
struct DropSignal(mpsc::UnboundedSender<&'static str>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        let _ = self.0.send("dropped");
    }
}

fn slow_service(signals: mpsc::UnboundedSender<&'static str>) -> Service {
    Service::new().method("slow", move |_| {
        let signal = DropSignal(signals.clone());
        async move {
            let _signal = signal;
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    })
}

#[tokio::test]
async fn common_server_reports_backend_os() {
    let registry = ServiceRegistry::new();
    registry
        .register(
            "CommonServerPath",
            Service::new().typed_method("getBackendOS", |(): ()| async {
                Ok::<_, SerializedError>(OperatingSystem::Windows)
            }),
        )
        .unwrap();
    let h = harness(registry, RpcConfig::default()).await;

    let common = h.client.get_proxy(&COMMON_SERVER);
    assert_eq!(common.get_backend_os().await.unwrap(), OperatingSystem::Windows);
}

#[tokio::test]
async fn scoped_service_names_dispatch() {
    let registry = ServiceRegistry::new();
    registry
        .register(
            "@opensumi/runner",
            Service::new().typed_method("$fetch", |url: String| async move {
                Ok::<_, SerializedError>(format!("fetched {url}"))
            }),
        )
        .unwrap();
    let h = harness(registry, RpcConfig::default()).await;

    let result = h
        .client
        .call("@opensumi/runner", "$fetch", vec![json!("/index")])
        .await
        .unwrap();
    assert_eq!(result, json!("fetched /index"));
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let h = harness(ServiceRegistry::new(), RpcConfig::default()).await;

    let err = h.client.call("ghost", "boo", vec![]).await.unwrap_err();
    match err {
        RpcError::MethodNotFound(name) => assert_eq!(name, "ghost#boo"),
        other => panic!("expected MethodNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_names_fail_before_sending() {
    let h = harness(ServiceRegistry::new(), RpcConfig::default()).await;
    assert!(matches!(
        h.client.call("a#b", "m", vec![]).await,
        Err(RpcError::InvalidName(_))
    ));
}

#[tokio::test]
async fn remote_errors_keep_their_cause_chain() {
    let registry = ServiceRegistry::new();
    registry
        .register(
            "files",
            Service::new().method("read", |_| async {
                Err(SerializedError::new("FileNotFound", "no such file: a.txt")
                    .with_stack("at read (files.rs:10)")
                    .with_cause(SerializedError::new("IoError", "ENOENT")))
            }),
        )
        .unwrap();
    let h = harness(registry, RpcConfig::default()).await;

    let err = h.client.call("files", "read", vec![]).await.unwrap_err();
    assert_eq!(err.name(), "FileNotFound");
    let RpcError::Remote(remote) = &err else {
        panic!("expected remote error, got {err:?}");
    };
    assert_eq!(remote.message(), "no such file: a.txt");
    assert_eq!(remote.stack(), Some("at read (files.rs:10)"));
    assert_eq!(remote.source().unwrap().to_string(), "IoError: ENOENT");
}

#[derive(Deserialize)]
struct Incident {
    title: String,
    failures: Vec<ErrorArg>,
}

#[tokio::test]
async fn errors_nested_in_arguments_cross_the_wire() {
    let registry = ServiceRegistry::new();
    registry
        .register(
            "incidents",
            Service::new()
                .typed_method("file", |incident: Incident| async move {
                    let first = &incident.failures[0].0;
                    let cause = first.cause.as_deref().map(|cause| cause.message.clone());
                    Ok::<_, SerializedError>(json!({
                        "title": incident.title,
                        "name": first.name,
                        "cause": cause,
                    }))
                })
                .method("echo", |mut args| async move { Ok(args.pop().unwrap_or(Value::Null)) }),
        )
        .unwrap();
    let h = harness(registry, RpcConfig::default()).await;

    let failure = SerializedError::new("TimeoutError", "deploy stalled")
        .with_cause(SerializedError::new("IoError", "socket reset"));
    let mut tagged = error_to_arg(&failure);
    tagged["debugOnly"] = json!(1);
    let incident = json!({"title": "outage", "failures": [tagged]});

    let filed = h
        .client
        .call("incidents", "file", vec![incident.clone()])
        .await
        .unwrap();
    assert_eq!(
        filed,
        json!({"title": "outage", "name": "TimeoutError", "cause": "socket reset"})
    );

    let echoed = h.client.call("incidents", "echo", vec![incident]).await.unwrap();
    assert_eq!(echoed["failures"][0], error_to_arg(&failure));
}

#[tokio::test]
async fn malformed_error_argument_is_rejected_on_both_ends() {
    let registry = || {
        let registry = ServiceRegistry::new();
        registry
            .register("svc", Service::new().method("take", |_| async { Ok(Value::Null) }))
            .unwrap();
        registry
    };
    let bogus = json!({"nested": {"$type": "Error", "name": 7}});

    let h = harness(registry(), RpcConfig::default()).await;
    match h.client.call("svc", "take", vec![bogus.clone()]).await {
        Err(RpcError::InvalidErrorArg(pointer)) => assert_eq!(pointer, "/0/nested"),
        other => panic!("expected InvalidErrorArg, got {other:?}"),
    }

    let (mut local, remote, _driver, _client_mux, _server_mux, _incoming) = open_pair().await;
    let _server = RpcPeer::spawn(remote, Arc::new(registry()), RpcConfig::default());
    let call = Envelope::Call {
        id: 1,
        name: "svc#take".to_string(),
        args: vec![bogus],
    };
    local.send(call.to_payload().unwrap()).unwrap();

    let Some(ChannelEvent::Data(payload)) = timeout(WAIT, local.recv()).await.unwrap() else {
        panic!("expected a response envelope");
    };
    match Envelope::from_payload(&payload).unwrap() {
        Envelope::Error { id, error } => {
            assert_eq!(id, 1);
            assert_eq!(error.name, INVALID_ARGUMENTS);
        }
        other => panic!("expected an error envelope, got {other:?}"),
    }
}

#[tokio::test]
async fn panicking_handler_rejects_call_and_peer_survives() {
    let registry = ServiceRegistry::new();
    registry
        .register(
            "svc",
            Service::new()
                .method("explode", |_| async { panic!("kaboom") })
                .method("ok", |_| async { Ok(json!("still here")) }),
        )
        .unwrap();
    let h = harness(registry, RpcConfig::default()).await;

    let err = h.client.call("svc", "explode", vec![]).await.unwrap_err();
    assert_eq!(err.name(), HANDLER_PANIC);
    assert!(err.to_string().contains("kaboom"));

    assert_eq!(
        h.client.call("svc", "ok", vec![]).await.unwrap(),
        json!("still here")
    );
}

#[tokio::test]
async fn calls_complete_out_of_order() {
    let registry = ServiceRegistry::new();
    registry
        .register(
            "timer",
            Service::new().typed_method("wait", |millis: u64| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, SerializedError>(millis)
            }),
        )
        .unwrap();
    let h = harness(registry, RpcConfig::default()).await;

    let slow = h.client.start_call("timer", "wait", vec![json!(150)]).unwrap();
    let fast = h.client.start_call("timer", "wait", vec![json!(5)]).unwrap();
    assert_ne!(slow.id(), fast.id());

    let fast_result = timeout(WAIT, fast).await.unwrap().unwrap();
    assert_eq!(fast_result, json!(5));
    let slow_result = timeout(WAIT, slow).await.unwrap().unwrap();
    assert_eq!(slow_result, json!(150));
}

#[tokio::test]
async fn timeout_rejects_and_aborts_remote_handler() {
    let (signals, mut signal_rx) = mpsc::unbounded_channel();
    let registry = ServiceRegistry::new();
    registry.register("svc", slow_service(signals)).unwrap();
    let h = harness(
        registry,
        RpcConfig::default().with_call_timeout(Duration::from_millis(50)),
    )
    .await;

    let err = h.client.call("svc", "slow", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));
    assert_eq!(err.name(), "Timeout");

    assert_eq!(
        timeout(WAIT, signal_rx.recv()).await.unwrap(),
        Some("dropped")
    );
}

#[tokio::test]
async fn cancel_aborts_remote_handler() {
    let (signals, mut signal_rx) = mpsc::unbounded_channel();
    let registry = ServiceRegistry::new();
    registry.register("svc", slow_service(signals)).unwrap();
    let h = harness(registry, RpcConfig::default()).await;

    let pending = h.client.start_call("svc", "slow", vec![]).unwrap();
    // Let the call reach the server before cancelling it.
    tokio::time::sleep(Duration::from_millis(20)).await;
    pending.cancel();

    assert_eq!(
        timeout(WAIT, signal_rx.recv()).await.unwrap(),
        Some("dropped")
    );
}

#[tokio::test]
async fn both_ends_serve_and_call() {
    let server_registry = ServiceRegistry::new();
    server_registry
        .register(
            "server",
            Service::new().method("name", |_| async { Ok(json!("server")) }),
        )
        .unwrap();
    let client_registry = ServiceRegistry::new();
    client_registry
        .register(
            "client",
            Service::new().method("name", |_| async { Ok(json!("client")) }),
        )
        .unwrap();
    let h = harness_with(server_registry, client_registry, RpcConfig::default()).await;

    assert_eq!(
        h.client.call("server", "name", vec![]).await.unwrap(),
        json!("server")
    );
    assert_eq!(
        h.server.call("client", "name", vec![]).await.unwrap(),
        json!("client")
    );
}

#[tokio::test]
async fn closed_channel_rejects_pending_call_once() {
    let (local, mut remote, _driver, _client_mux, _server_mux, _incoming) = open_pair().await;
    let client = RpcPeer::spawn(local, Arc::new(ServiceRegistry::new()), RpcConfig::default());

    let pending = client.start_call("svc", "hang", vec![]).unwrap();
    let Some(ChannelEvent::Data(payload)) = timeout(WAIT, remote.recv()).await.unwrap() else {
        panic!("expected the call envelope");
    };
    let call = Envelope::from_payload(&payload).unwrap();
    remote.close();

    let err = timeout(WAIT, pending).await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::ChannelClosed(_)), "got {err:?}");

    // The response can no longer be delivered.
    let late = Envelope::Result {
        id: call.id(),
        result: json!("too late"),
    };
    assert!(remote.send(late.to_payload().unwrap()).is_err());

    client.closed().await;
    assert!(matches!(
        client.call("svc", "hang", vec![]).await,
        Err(RpcError::ChannelClosed(_))
    ));
}

#[tokio::test]
async fn unknown_and_duplicate_responses_are_ignored() {
    let (local, mut remote, _driver, _client_mux, _server_mux, _incoming) = open_pair().await;
    let client = RpcPeer::spawn(local, Arc::new(ServiceRegistry::new()), RpcConfig::default());

    let pending = client.start_call("svc", "answer", vec![]).unwrap();
    let Some(ChannelEvent::Data(payload)) = timeout(WAIT, remote.recv()).await.unwrap() else {
        panic!("expected the call envelope");
    };
    let id = Envelope::from_payload(&payload).unwrap().id();

    let stray = Envelope::Result {
        id: id + 1000,
        result: json!("stray"),
    };
    remote.send(stray.to_payload().unwrap()).unwrap();
    let real = Envelope::Result {
        id,
        result: json!(42),
    };
    remote.send(real.to_payload().unwrap()).unwrap();
    remote.send(real.to_payload().unwrap()).unwrap();

    assert_eq!(timeout(WAIT, pending).await.unwrap().unwrap(), json!(42));
    assert!(!client.is_closed());
}

#[tokio::test]
async fn transport_loss_is_connection_lost() {
    let registry = ServiceRegistry::new();
    registry
        .register(
            "svc",
            Service::new().method("hang", |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
        )
        .unwrap();
    let h = harness(registry, RpcConfig::default()).await;

    let pending = h.client.start_call("svc", "hang", vec![]).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.driver.sever();

    let err = timeout(WAIT, pending).await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::ConnectionLost), "got {err:?}");
    assert!(err.is_disconnect());
}
