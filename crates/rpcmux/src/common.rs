//! The `CommonServer` service every rpcmux server exposes.
//!
//! Served under [`COMMON_SERVER_ID`] on the default channel path:
//! - `getBackendOS()` -> [`OperatingSystem`]
//! - `echo(value)` -> `value`

use rpcmux_rpc::{
    FromProxy, ProxyIdentifier, RemoteProxy, Result, SerializedError, Service, ServiceRegistry,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const COMMON_SERVER_ID: &str = "CommonServerPath";

pub const COMMON_SERVER: ProxyIdentifier<CommonServerClient> =
    ProxyIdentifier::new(COMMON_SERVER_ID);

/// Operating system family of the serving process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingSystem {
    Windows,
    Linux,
    Macintosh,
}

impl OperatingSystem {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => OperatingSystem::Windows,
            "macos" => OperatingSystem::Macintosh,
            _ => OperatingSystem::Linux,
        }
    }
}

impl std::fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperatingSystem::Windows => "Windows",
            OperatingSystem::Linux => "Linux",
            OperatingSystem::Macintosh => "Macintosh",
        };
        f.write_str(name)
    }
}

/// Typed client for the `CommonServer` service.
#[derive(Debug, Clone)]
pub struct CommonServerClient {
    proxy: RemoteProxy,
}

impl FromProxy for CommonServerClient {
    fn from_proxy(proxy: RemoteProxy) -> Self {
        Self { proxy }
    }
}

impl CommonServerClient {
    pub async fn get_backend_os(&self) -> Result<OperatingSystem> {
        self.proxy.invoke("getBackendOS", vec![]).await
    }

    pub async fn echo(&self, value: Value) -> Result<Value> {
        self.proxy.call("echo", vec![value]).await
    }
}

/// Method table reporting `os` as the backend operating system.
pub fn common_server_service(os: OperatingSystem) -> Service {
    Service::new()
        .typed_method("getBackendOS", move |(): ()| async move {
            Ok::<_, SerializedError>(os)
        })
        .method("echo", |mut args| async move {
            Ok(args.pop().unwrap_or(Value::Null))
        })
}

pub fn register_common_server(registry: &ServiceRegistry, os: OperatingSystem) -> Result<()> {
    registry.register(COMMON_SERVER_ID, common_server_service(os))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rpcmux_connection::{ConnectionConfig, ConnectionManager, FnConnector, ServerConnection};
    use rpcmux_transport::{MemoryDriver, TransportDriver, TransportError};
    use serde_json::json;

    use super::*;

    /// Client connected to an in-process server. The server handles are
    /// returned so the connections outlive the dial.
    async fn connected(
        os: OperatingSystem,
    ) -> (ConnectionManager, Arc<Mutex<Vec<ServerConnection>>>) {
        let registry = ServiceRegistry::new();
        register_common_server(&registry, os).unwrap();
        let registry = Arc::new(registry);
        let servers = Arc::new(Mutex::new(Vec::new()));

        let accepted = Arc::clone(&servers);
        let connector = FnConnector::new("memory", move || {
            let (client, server) = MemoryDriver::pair();
            let connection = ServerConnection::serve(
                Arc::new(server),
                Arc::clone(&registry),
                ConnectionConfig::default(),
            );
            accepted.lock().unwrap().push(connection);
            std::future::ready(Ok::<_, TransportError>(
                Arc::new(client) as Arc<dyn TransportDriver>
            ))
        });
        let manager = ConnectionManager::new(
            connector,
            Arc::new(ServiceRegistry::new()),
            ConnectionConfig::default(),
        );
        manager.connect().await.unwrap();
        (manager, servers)
    }

    #[tokio::test]
    async fn backend_os_resolves_to_windows() {
        let (manager, _servers) = connected(OperatingSystem::Windows).await;
        let common = manager.get_proxy(&COMMON_SERVER);
        assert_eq!(common.get_backend_os().await.unwrap(), OperatingSystem::Windows);
    }

    #[tokio::test]
    async fn echo_returns_its_argument() {
        let (manager, _servers) = connected(OperatingSystem::current()).await;
        let common = manager.get_proxy(&COMMON_SERVER);
        let value = json!({"nested": [1, "two", null]});
        assert_eq!(common.echo(value.clone()).await.unwrap(), value);
    }

    #[test]
    fn operating_system_wire_names() {
        assert_eq!(
            serde_json::to_value(OperatingSystem::Macintosh).unwrap(),
            json!("Macintosh")
        );
        assert_eq!(COMMON_SERVER.service_id(), "CommonServerPath");
        assert_eq!(COMMON_SERVER.path(), rpcmux_rpc::DEFAULT_RPC_PATH);
    }
}
