//! RPC names: `serviceId#method`.

use crate::error::{Result, RpcError};

/// Separator between service id and method in an RPC name.
pub const RPC_NAME_SEPARATOR: char = '#';

/// Join a service id and a method into one RPC name.
///
/// Fails if either part contains [`RPC_NAME_SEPARATOR`], since the name
/// could not be split back unambiguously.
pub fn get_rpc_name(service_id: &str, method: &str) -> Result<String> {
    for part in [service_id, method] {
        if part.contains(RPC_NAME_SEPARATOR) {
            return Err(RpcError::InvalidName(format!(
                "'{part}' contains reserved separator '{RPC_NAME_SEPARATOR}'"
            )));
        }
    }
    Ok(format!("{service_id}{RPC_NAME_SEPARATOR}{method}"))
}

/// Split an RPC name produced by [`get_rpc_name`].
pub fn extract_service_and_method(name: &str) -> Result<(String, String)> {
    let (service_id, method) = name.split_once(RPC_NAME_SEPARATOR).ok_or_else(|| {
        RpcError::InvalidName(format!("'{name}' has no '{RPC_NAME_SEPARATOR}' separator"))
    })?;
    if method.contains(RPC_NAME_SEPARATOR) {
        return Err(RpcError::InvalidName(format!(
            "'{name}' contains more than one separator"
        )));
    }
    Ok((service_id.to_owned(), method.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_names_roundtrip() {
        let name = get_rpc_name("@opensumi/runner", "$fetch").unwrap();
        assert_eq!(name, "@opensumi/runner#$fetch");
        assert_eq!(
            extract_service_and_method(&name).unwrap(),
            ("@opensumi/runner".to_string(), "$fetch".to_string())
        );
    }

    #[test]
    fn names_with_dots_colons_and_slashes_roundtrip() {
        for (service, method) in [
            ("CommonServerPath", "getBackendOS"),
            ("a.b.c", "x:y"),
            ("", "bare"),
            ("svc", ""),
            ("fs/watcher", "on.change"),
        ] {
            let name = get_rpc_name(service, method).unwrap();
            assert_eq!(
                extract_service_and_method(&name).unwrap(),
                (service.to_string(), method.to_string())
            );
        }
    }

    #[test]
    fn separator_in_parts_fails_fast() {
        assert!(matches!(
            get_rpc_name("a#b", "m"),
            Err(RpcError::InvalidName(_))
        ));
        assert!(matches!(
            get_rpc_name("svc", "m#2"),
            Err(RpcError::InvalidName(_))
        ));
    }

    #[test]
    fn malformed_names_rejected() {
        assert!(matches!(
            extract_service_and_method("no-separator"),
            Err(RpcError::InvalidName(_))
        ));
        assert!(matches!(
            extract_service_and_method("a#b#c"),
            Err(RpcError::InvalidName(_))
        ));
    }
}
