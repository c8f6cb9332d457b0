//! Error types for pfpstatus.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all pfpstatus operations.
///
/// Store validation, configuration, authority transport, dump and serve
/// failures all funnel into this enum so callers can use a single
/// [`Result`] alias.
#[derive(Error, Debug)]
pub enum PfpStatusError {
    /// Error constructing a recorder or pushing a status into it.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// Error reading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error talking to the external authentication/authorization authority.
    #[error("authority error: {0}")]
    Authority(#[from] AuthorityError),

    /// Error dumping the recorder content.
    #[error("dump error: {0}")]
    Dump(#[from] DumpError),

    /// Error running the HTTP listener.
    #[error("serve error: {0}")]
    Serve(#[from] ServeError),

    /// The lock guarding the recorder was poisoned by a panicking holder.
    #[error("recorder lock poisoned")]
    LockPoisoned,
}

/// Errors returned by recorder construction and push validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// A node recorder was requested for an empty node name.
    #[error("invalid node identity: node name must not be empty")]
    InvalidNodeIdentity,

    /// The per-node capacity is below 1.
    #[error("invalid capacity {capacity} (must be >= 1)")]
    InvalidCapacity {
        /// The rejected capacity.
        capacity: usize,
    },

    /// The maximum node count is below 1.
    #[error("invalid node count {max_nodes} (must be >= 1)")]
    InvalidNodeCount {
        /// The rejected node count.
        max_nodes: usize,
    },

    /// The pushed status carries no node name.
    #[error("missing node identity in status")]
    MissingNodeIdentity,

    /// The pushed status belongs to a different node.
    #[error("mismatching node identity: recorder is for '{expected}', status is for '{found}'")]
    NodeIdentityMismatch {
        /// Node the recorder was created for.
        expected: String,
        /// Node found in the status.
        found: String,
    },

    /// A new node was pushed while the node cap was already reached.
    #[error("excessive node count: cannot track more than {max_nodes} nodes")]
    TooManyNodes {
        /// The configured node cap.
        max_nodes: usize,
    },
}

/// Errors that can occur while building configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required environment variable is unset or empty.
    #[error("environment variable {name} is not set")]
    MissingEnv {
        /// The variable name.
        name: String,
    },

    /// A port value could not be parsed.
    #[error("invalid port '{value}': {source}")]
    InvalidPort {
        /// The raw value.
        value: String,
        /// The parse failure.
        #[source]
        source: std::num::ParseIntError,
    },

    /// A file referenced by the configuration could not be read.
    #[error("failed to read '{}': {source}", path.display())]
    ReadFile {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur when calling the external authority.
#[derive(Error, Debug)]
pub enum AuthorityError {
    /// Failed to create the HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The CA bundle is not valid PEM.
    #[error("invalid CA certificate: {source}")]
    InvalidCertificate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The request could not be sent or timed out.
    #[error("HTTP request failed: {source}")]
    RequestFailed {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The authority answered with a non-2xx status.
    #[error("authority returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// The authority answer could not be decoded.
    #[error("failed to decode authority response: {source}")]
    Decode {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
}

/// Errors that can occur while dumping recorder content to disk.
#[derive(Error, Debug)]
pub enum DumpError {
    /// The dump directory does not exist.
    #[error("dump directory '{}' does not exist", path.display())]
    MissingDirectory {
        /// The configured directory.
        path: PathBuf,
    },

    /// Failed to serialize node content.
    #[error("failed to serialize content for node '{node}': {source}")]
    Serialize {
        /// The node being dumped.
        node: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to write a dump file.
    #[error("failed to write dump file '{}': {source}", path.display())]
    Write {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while running the HTTP listener.
#[derive(Error, Debug)]
pub enum ServeError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The listener could not be configured.
    #[error("failed to configure listener: {source}")]
    Listener {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        /// The thread name.
        name: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Type alias for `Result<T, PfpStatusError>`.
pub type Result<T> = std::result::Result<T, PfpStatusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_error_converts() {
        let err: PfpStatusError = RecordError::TooManyNodes { max_nodes: 4 }.into();
        assert!(matches!(
            err,
            PfpStatusError::Record(RecordError::TooManyNodes { max_nodes: 4 })
        ));
        assert_eq!(
            err.to_string(),
            "record error: excessive node count: cannot track more than 4 nodes"
        );
    }

    #[test]
    fn test_mismatch_message_names_both_nodes() {
        let err = RecordError::NodeIdentityMismatch {
            expected: "node-0".to_string(),
            found: "node-1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("node-0"));
        assert!(msg.contains("node-1"));
    }
}
