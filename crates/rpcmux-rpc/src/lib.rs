//! RPC layer for rpcmux.
//!
//! Carries method calls over multiplexed channels:
//! - [`name`] joins and splits `serviceId#method` names
//! - [`envelope`] is the JSON call/result/error/cancel message
//! - [`serialized_error`] moves error chains across the wire
//! - [`registry`] holds the services this end exposes
//! - [`peer`] runs one channel's calls in both directions
//! - [`proxy`] builds typed clients from [`ProxyIdentifier`]s

pub mod config;
pub mod envelope;
pub mod error;
pub mod name;
pub mod peer;
pub mod proxy;
pub mod registry;
pub mod serialized_error;

pub use config::RpcConfig;
pub use envelope::{Envelope, RequestId};
pub use error::{Result, RpcError};
pub use name::{extract_service_and_method, get_rpc_name, RPC_NAME_SEPARATOR};
pub use peer::{PendingCall, RpcPeer, HANDLER_PANIC};
pub use proxy::{get_proxy, CallTarget, FromProxy, ProxyIdentifier, RemoteProxy, DEFAULT_RPC_PATH};
pub use registry::{MethodHandler, MethodResult, Service, ServiceRegistry, INVALID_ARGUMENTS};
pub use serialized_error::{
    arg_to_error, error_to_arg, normalize_error_args, ErrorArg, RemoteError, SerializedError,
};
