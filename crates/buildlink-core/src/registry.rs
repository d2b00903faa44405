//! Registry host handling.

/// Normalize a registry server address so that all aliases of Docker Hub map
/// to the same credential key.
pub fn normalize_server_address(address: &str) -> String {
    match address {
        "docker.io" | "registry-1.docker.io" => "index.docker.io".to_string(),
        other => other.to_string(),
    }
}
