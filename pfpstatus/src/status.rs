//! Status events produced by the fingerprint engine.
//!
//! A [`Status`] is opaque to the recorder beyond the fields below. It is a
//! plain value: the recorder always stores its own copy.

use serde::{Deserialize, Serialize};

/// Namespace and name of a pod taken into account by a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedName {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
}

impl NamespacedName {
    /// Creates a new namespaced name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Outcome of one fingerprint computation for a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Fingerprint the node is expected to have.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fingerprint_expected: String,
    /// Fingerprint computed from the pods the engine saw.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fingerprint_computed: String,
    /// Pods included in the computation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<NamespacedName>,
    /// Node the status belongs to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
}

impl Status {
    /// Creates an empty status for `node_name`.
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Sets the expected fingerprint.
    #[must_use]
    pub fn with_expected(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint_expected = fingerprint.into();
        self
    }

    /// Sets the computed fingerprint.
    #[must_use]
    pub fn with_computed(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint_computed = fingerprint.into();
        self
    }

    /// Sets the pod list.
    #[must_use]
    pub fn with_pods(mut self, pods: Vec<NamespacedName>) -> Self {
        self.pods = pods;
        self
    }

    /// Returns true if both fingerprints are identical to the ones in `other`.
    pub fn same_fingerprints(&self, other: &Status) -> bool {
        self.fingerprint_expected == other.fingerprint_expected
            && self.fingerprint_computed == other.fingerprint_computed
    }

    /// Returns true if the computed fingerprint matches the expected one.
    pub fn is_consistent(&self) -> bool {
        self.fingerprint_expected == self.fingerprint_computed
    }
}
