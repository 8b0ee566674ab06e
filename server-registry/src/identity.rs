//! Process identity for registry participation.

/// Who this process is within the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub server_id: String,
    pub hostname: String,
    pub process_id: u32,
}

impl ServerIdentity {
    /// Resolve the identity of the running process.
    ///
    /// A non-blank `explicit_id` wins; otherwise the id is `<hostname>-<pid>`.
    /// An explicit id must be stable across restarts for a process to keep its
    /// rank.
    pub fn resolve(explicit_id: Option<&str>) -> Self {
        let hostname = local_hostname();
        let process_id = std::process::id();
        let server_id = match explicit_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("{}-{}", hostname, process_id),
        };
        Self {
            server_id,
            hostname,
            process_id,
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
