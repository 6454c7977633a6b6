//! Service registry for dispatching calls by name.
//!
//! Services are plain method tables assembled with [`Service::method`] and
//! [`Service::typed_method`] and registered under a service id:
//!
//! ```ignore
//! let registry = ServiceRegistry::new();
//! registry.register(
//!     "CommonServerPath",
//!     Service::new().typed_method("getBackendOS", |(): ()| async {
//!         Ok::<_, SerializedError>("Linux")
//!     }),
//! )?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use rpcmux_transport::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, RpcError};
use crate::name::{extract_service_and_method, get_rpc_name};
use crate::serialized_error::SerializedError;

/// Outcome of one method invocation.
pub type MethodResult = std::result::Result<Value, SerializedError>;

/// Type-erased method implementation.
pub type MethodHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Error name reported when arguments do not match a typed method.
pub const INVALID_ARGUMENTS: &str = "InvalidArguments";

/// A method table for one service.
#[derive(Clone, Default)]
pub struct Service {
    methods: HashMap<String, MethodHandler>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method that receives the raw argument list.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let handler: MethodHandler =
            Arc::new(move |args| -> BoxFuture<'static, MethodResult> { Box::pin(handler(args)) });
        self.methods.insert(name.into(), handler);
        self
    }

    /// Add a method whose arguments are deserialized into `A` and whose
    /// result is serialized from `R`.
    ///
    /// `A` is decoded from the argument list as a whole (tuples, `Vec`), or
    /// from the sole argument when there is exactly one; `()` accepts an
    /// empty list.
    pub fn typed_method<A, R, E, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<SerializedError> + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.method(name, move |args| {
            let handler = Arc::clone(&handler);
            async move {
                let args = decode_args::<A>(args)?;
                let result = match handler(args).await {
                    Ok(result) => result,
                    Err(err) => return Err(err.into()),
                };
                serde_json::to_value(result)
                    .map_err(|err| SerializedError::new("SerializationError", err.to_string()))
            }
        })
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    fn get(&self, name: &str) -> Option<MethodHandler> {
        self.methods.get(name).cloned()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.method_names().collect();
        names.sort_unstable();
        f.debug_struct("Service").field("methods", &names).finish()
    }
}

fn decode_args<A: DeserializeOwned>(mut args: Vec<Value>) -> std::result::Result<A, SerializedError> {
    let invalid = |err: serde_json::Error| SerializedError::new(INVALID_ARGUMENTS, err.to_string());
    match args.len() {
        0 => serde_json::from_value(Value::Null)
            .or_else(|_| serde_json::from_value(Value::Array(Vec::new())))
            .map_err(invalid),
        1 => {
            let sole = args.pop().unwrap_or(Value::Null);
            match serde_json::from_value(sole.clone()) {
                Ok(decoded) => Ok(decoded),
                Err(_) => serde_json::from_value(Value::Array(vec![sole])).map_err(invalid),
            }
        }
        _ => serde_json::from_value(Value::Array(args)).map_err(invalid),
    }
}

/// Services available to remote callers, keyed by service id.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under `service_id`, replacing any previous
    /// registration.
    ///
    /// Fails if the id or any method name contains the RPC name separator.
    pub fn register(&self, service_id: impl Into<String>, service: Service) -> Result<()> {
        let service_id = service_id.into();
        for method in service.method_names() {
            get_rpc_name(&service_id, method)?;
        }
        if service.methods.is_empty() {
            get_rpc_name(&service_id, "")?;
        }

        let replaced = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service_id.clone(), service)
            .is_some();
        debug!(service = %service_id, replaced, "service registered");
        Ok(())
    }

    pub fn unregister(&self, service_id: &str) -> bool {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service_id)
            .is_some()
    }

    pub fn lookup(&self, service_id: &str, method: &str) -> Option<MethodHandler> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_id)
            .and_then(|service| service.get(method))
    }

    /// Resolve a full RPC name to its handler.
    pub fn resolve(&self, rpc_name: &str) -> Result<MethodHandler> {
        let (service_id, method) = extract_service_and_method(rpc_name)
            .map_err(|_| RpcError::MethodNotFound(rpc_name.to_owned()))?;
        self.lookup(&service_id, &method)
            .ok_or_else(|| RpcError::MethodNotFound(rpc_name.to_owned()))
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(service_id)
    }

    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.service_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn calculator() -> Service {
        Service::new()
            .typed_method("add", |(a, b): (i64, i64)| async move {
                Ok::<_, SerializedError>(a + b)
            })
            .typed_method("shout", |text: String| async move {
                Ok::<_, SerializedError>(text.to_uppercase())
            })
            .typed_method("zero", |(): ()| async { Ok::<_, SerializedError>(0) })
            .method("count", |args| async move { Ok(json!(args.len())) })
    }

    #[tokio::test]
    async fn typed_methods_decode_arguments() {
        let registry = ServiceRegistry::new();
        registry.register("calc", calculator()).unwrap();

        let add = registry.resolve("calc#add").unwrap();
        assert_eq!(add(vec![json!(2), json!(3)]).await.unwrap(), json!(5));

        let shout = registry.lookup("calc", "shout").unwrap();
        assert_eq!(shout(vec![json!("hi")]).await.unwrap(), json!("HI"));

        let zero = registry.lookup("calc", "zero").unwrap();
        assert_eq!(zero(vec![]).await.unwrap(), json!(0));

        let count = registry.lookup("calc", "count").unwrap();
        assert_eq!(count(vec![json!(1), json!(null)]).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn wrong_arguments_are_reported() {
        let registry = ServiceRegistry::new();
        registry.register("calc", calculator()).unwrap();

        let add = registry.resolve("calc#add").unwrap();
        let err = add(vec![json!("two")]).await.unwrap_err();
        assert_eq!(err.name, INVALID_ARGUMENTS);
    }

    #[tokio::test]
    async fn handler_errors_are_serialized() {
        #[derive(Debug, thiserror::Error)]
        #[error("quota exceeded")]
        struct Quota;

        let service = Service::new().typed_method("fail", |(): ()| async { Err::<(), _>(Quota) });
        let registry = ServiceRegistry::new();
        registry.register("svc", service).unwrap();

        let fail = registry.resolve("svc#fail").unwrap();
        let err = fail(vec![]).await.unwrap_err();
        assert_eq!(err.message, "quota exceeded");
    }

    #[test]
    fn unknown_names_are_method_not_found() {
        let registry = ServiceRegistry::new();
        registry.register("calc", calculator()).unwrap();

        assert!(matches!(
            registry.resolve("calc#divide"),
            Err(RpcError::MethodNotFound(name)) if name == "calc#divide"
        ));
        assert!(matches!(
            registry.resolve("nope#add"),
            Err(RpcError::MethodNotFound(_))
        ));
        assert!(matches!(
            registry.resolve("garbage"),
            Err(RpcError::MethodNotFound(_))
        ));
    }

    #[test]
    fn separator_in_names_is_rejected() {
        let registry = ServiceRegistry::new();
        assert!(matches!(
            registry.register("a#b", Service::new()),
            Err(RpcError::InvalidName(_))
        ));
        let bad_method = Service::new().method("x#y", |_| async { Ok(Value::Null) });
        assert!(matches!(
            registry.register("svc", bad_method),
            Err(RpcError::InvalidName(_))
        ));
        assert!(registry.service_ids().is_empty());
    }

    #[test]
    fn register_replaces_and_unregister_removes() {
        let registry = ServiceRegistry::new();
        registry.register("calc", calculator()).unwrap();
        registry
            .register("calc", Service::new().method("only", |_| async { Ok(Value::Null) }))
            .unwrap();

        assert!(registry.lookup("calc", "add").is_none());
        assert!(registry.lookup("calc", "only").is_some());
        assert!(registry.unregister("calc"));
        assert!(!registry.contains("calc"));
        assert!(!registry.unregister("calc"));
    }
}
