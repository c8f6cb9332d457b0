//! Bounded recorders for fingerprint statuses.
//!
//! This module provides the two-level store behind pfpstatus:
//!
//! - [`NodeRecorder`] keeps the history of exactly one node as a FIFO ring
//!   buffer, bounded by entry count and optionally by cumulative byte size.
//! - [`Recorder`] maps node names to lazily created [`NodeRecorder`]s and caps
//!   how many distinct nodes are tracked.
//!
//! # Design
//!
//! Eviction is strictly by insertion order: when room is needed the oldest
//! entries go first, regardless of their content. Byte sizes are approximate,
//! computed once per entry when it is recorded, and only drive eviction.
//!
//! Neither recorder is internally synchronized. The owner is expected to put
//! the [`Recorder`] behind a single lock shared by writers and readers (see
//! [`crate::setup::Environ`]).
//!
//! # Example
//!
//! ```rust
//! use pfpstatus::record::{NodeRecorder, NodeRecorderConfig};
//! use pfpstatus::Status;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeRecorderConfig::default().with_capacity(2).with_coalescing(true);
//! let mut nr = NodeRecorder::new("node-0", config)?;
//!
//! nr.push(Status::new("node-0").with_expected("a").with_computed("a"))?;
//! // same fingerprints as the last entry: absorbed
//! nr.push(Status::new("node-0").with_expected("a").with_computed("a"))?;
//! assert_eq!(nr.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{RecordError, Result};
use crate::status::Status;

/// Default cap on distinct nodes for a [`RecorderConfig`].
pub const DEFAULT_MAX_NODES: usize = 1023;

/// Upper bound on slots reserved up front for a node history.
const MAX_PREALLOCATED_SLOTS: usize = 64;

/// Source of record timestamps, in nanoseconds since the Unix epoch.
///
/// Injected so tests can drive ordering and eviction deterministically.
pub type Timestamper = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Returns the wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

/// Returns the default timestamper, backed by [`now_ns`].
pub fn wall_clock() -> Timestamper {
    Arc::new(now_ns)
}

/// A [`Status`] plus the metadata added when it was recorded.
///
/// Two recorded statuses are equal when their statuses are equal; the record
/// time and size are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedStatus {
    /// The recorded status.
    #[serde(flatten)]
    pub status: Status,
    /// When the status was recorded, in nanoseconds since the Unix epoch.
    #[serde(rename = "recordTime")]
    pub record_time: u64,
    /// Approximate serialized size in bytes, fixed at creation.
    #[serde(skip)]
    size: usize,
}

impl RecordedStatus {
    /// Wraps `status` with its record time and computes its approximate size.
    pub fn new(status: Status, record_time: u64) -> Self {
        let mut item = Self {
            status,
            record_time,
            size: 0,
        };
        item.size = item.approximate_size();
        item
    }

    /// Returns the approximate serialized size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn approximate_size(&self) -> usize {
        let mut counter = ByteCounter(0);
        // a failed serialization still leaves a usable lower bound
        if let Err(e) = serde_json::to_writer(&mut counter, self) {
            tracing::debug!(node = %self.status.node_name, error = %e, "approximating entry size");
        }
        counter.0
    }
}

impl PartialEq for RecordedStatus {
    fn eq(&self, other: &Self) -> bool {
        self.status == other.status
    }
}

impl Eq for RecordedStatus {}

/// Writer that only counts the bytes it is given.
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Configuration of a single [`NodeRecorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecorderConfig {
    /// Maximum number of entries kept. Must be at least 1.
    pub capacity: usize,
    /// Maximum cumulative approximate size in bytes. 0 means unlimited.
    pub max_size: usize,
    /// Drop a push whose fingerprints equal the last recorded ones.
    pub coalesce: bool,
}

impl Default for NodeRecorderConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            max_size: 0,
            coalesce: false,
        }
    }
}

impl NodeRecorderConfig {
    /// Sets the entry capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the cumulative size limit (0 = unlimited).
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Enables or disables coalescing.
    #[must_use]
    pub fn with_coalescing(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }
}

/// Recorded statuses for one node, oldest first.
///
/// The history is a ring buffer: only the latest `capacity` statuses are
/// kept, and when a size limit is set the cumulative approximate size of the
/// kept statuses stays within it. Statuses for other nodes are rejected.
pub struct NodeRecorder {
    /// Node this recorder belongs to.
    node_name: String,
    /// Maximum number of entries.
    capacity: usize,
    /// Maximum cumulative size, 0 for unlimited.
    max_size: usize,
    /// Current cumulative size.
    size: usize,
    /// Entries, oldest at the front.
    statuses: VecDeque<RecordedStatus>,
    /// Whether duplicate consecutive fingerprints are absorbed.
    coalesce: bool,
    /// Record time source.
    timestamper: Timestamper,
}

impl fmt::Debug for NodeRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRecorder")
            .field("node_name", &self.node_name)
            .field("capacity", &self.capacity)
            .field("max_size", &self.max_size)
            .field("size", &self.size)
            .field("len", &self.statuses.len())
            .field("coalesce", &self.coalesce)
            .finish_non_exhaustive()
    }
}

impl NodeRecorder {
    /// Creates an empty recorder for `node_name`, timestamped by the wall clock.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::InvalidNodeIdentity`] if `node_name` is empty
    /// and [`RecordError::InvalidCapacity`] if the capacity is below 1.
    pub fn new(node_name: impl Into<String>, config: NodeRecorderConfig) -> Result<Self> {
        let node_name = node_name.into();
        if node_name.is_empty() {
            return Err(RecordError::InvalidNodeIdentity.into());
        }
        if config.capacity < 1 {
            return Err(RecordError::InvalidCapacity {
                capacity: config.capacity,
            }
            .into());
        }

        Ok(Self {
            node_name,
            capacity: config.capacity,
            max_size: config.max_size,
            size: 0,
            statuses: VecDeque::with_capacity(config.capacity.min(MAX_PREALLOCATED_SLOTS)),
            coalesce: config.coalesce,
            timestamper: wall_clock(),
        })
    }

    /// Replaces the record time source.
    #[must_use]
    pub fn with_timestamper(mut self, timestamper: Timestamper) -> Self {
        self.timestamper = timestamper;
        self
    }

    /// Records `status`, evicting the oldest entries if needed.
    ///
    /// With coalescing enabled, a status whose fingerprints equal the last
    /// recorded ones is accepted without changing the history. Nothing is
    /// evicted when the push is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::MissingNodeIdentity`] if the status has no node
    /// name and [`RecordError::NodeIdentityMismatch`] if it belongs to
    /// another node.
    pub fn push(&mut self, status: Status) -> Result<()> {
        if status.node_name.is_empty() {
            return Err(RecordError::MissingNodeIdentity.into());
        }
        if status.node_name != self.node_name {
            return Err(RecordError::NodeIdentityMismatch {
                expected: self.node_name.clone(),
                found: status.node_name,
            }
            .into());
        }

        if self.coalesce
            && self
                .statuses
                .back()
                .is_some_and(|last| last.status.same_fingerprints(&status))
        {
            return Ok(());
        }

        let item = RecordedStatus::new(status, (self.timestamper)());

        if self.capacity == 1 {
            // single slot, overwritten in place
            self.size = item.size();
            match self.statuses.front_mut() {
                Some(slot) => *slot = item,
                None => self.statuses.push_back(item),
            }
            return Ok(());
        }

        self.make_room(item.size());
        self.size += item.size();
        self.statuses.push_back(item);
        Ok(())
    }

    /// Evicts entries until one more of `incoming` bytes fits.
    fn make_room(&mut self, incoming: usize) {
        while self.statuses.len() >= self.capacity {
            self.drop_oldest();
        }
        if self.max_size == 0 {
            return;
        }
        if incoming >= self.max_size {
            self.statuses.clear();
            self.size = 0;
            return;
        }
        while self.size + incoming > self.max_size && self.drop_oldest() {}
    }

    /// Removes the oldest entry. Returns false if there was none.
    fn drop_oldest(&mut self) -> bool {
        match self.statuses.pop_front() {
            Some(oldest) => {
                self.size = self.size.saturating_sub(oldest.size());
                true
            }
            None => false,
        }
    }

    /// Returns the node this recorder belongs to.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Returns how many statuses are currently held.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Returns true if no status is held.
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Returns the maximum number of statuses held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the cumulative size limit (0 = unlimited).
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns the current cumulative approximate size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns true if duplicate consecutive fingerprints are absorbed.
    pub fn is_coalescing(&self) -> bool {
        self.coalesce
    }

    /// Returns a copy of the recorded statuses, oldest first.
    pub fn content(&self) -> Vec<RecordedStatus> {
        self.statuses.iter().cloned().collect()
    }
}

/// Configuration of a [`Recorder`] and of the node recorders it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderConfig {
    /// Maximum number of distinct nodes. Must be at least 1.
    pub max_nodes: usize,
    /// Capacity of each node recorder. Must be at least 1.
    pub node_capacity: usize,
    /// Size limit of each node recorder (0 = unlimited).
    pub max_size_per_node: usize,
    /// Coalescing setting of each node recorder.
    pub coalesce: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_nodes: DEFAULT_MAX_NODES,
            node_capacity: 1,
            max_size_per_node: 0,
            coalesce: false,
        }
    }
}

impl RecorderConfig {
    /// Sets the maximum number of distinct nodes.
    #[must_use]
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    /// Sets the per-node capacity.
    #[must_use]
    pub fn with_node_capacity(mut self, node_capacity: usize) -> Self {
        self.node_capacity = node_capacity;
        self
    }

    /// Sets the per-node size limit (0 = unlimited).
    #[must_use]
    pub fn with_max_size_per_node(mut self, max_size: usize) -> Self {
        self.max_size_per_node = max_size;
        self
    }

    /// Enables or disables per-node coalescing.
    #[must_use]
    pub fn with_coalescing(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    /// Returns the configuration applied to each new node recorder.
    pub fn node_config(&self) -> NodeRecorderConfig {
        NodeRecorderConfig {
            capacity: self.node_capacity,
            max_size: self.max_size_per_node,
            coalesce: self.coalesce,
        }
    }
}

/// Recorded statuses for all nodes, divided by node name.
///
/// Node recorders are created lazily on the first push for a node, up to
/// `max_nodes`, and live as long as the recorder. Once the cap is reached new
/// nodes are rejected while known nodes keep recording.
pub struct Recorder {
    /// Per-node histories.
    nodes: HashMap<String, NodeRecorder>,
    /// Limits applied to the map and to new node recorders.
    config: RecorderConfig,
    /// Record time source shared with every node recorder.
    timestamper: Timestamper,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("config", &self.config)
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Creates an empty recorder, timestamped by the wall clock.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::InvalidNodeCount`] if `max_nodes` is below 1
    /// and [`RecordError::InvalidCapacity`] if `node_capacity` is below 1.
    pub fn new(config: RecorderConfig) -> Result<Self> {
        if config.max_nodes < 1 {
            return Err(RecordError::InvalidNodeCount {
                max_nodes: config.max_nodes,
            }
            .into());
        }
        if config.node_capacity < 1 {
            return Err(RecordError::InvalidCapacity {
                capacity: config.node_capacity,
            }
            .into());
        }

        Ok(Self {
            nodes: HashMap::new(),
            config,
            timestamper: wall_clock(),
        })
    }

    /// Replaces the record time source used by node recorders created later.
    #[must_use]
    pub fn with_timestamper(mut self, timestamper: Timestamper) -> Self {
        self.timestamper = timestamper;
        self
    }

    /// Records `status` in the history of its node.
    ///
    /// The node recorder is created on first use if the node cap allows it.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::MissingNodeIdentity`] if the status has no node
    /// name and [`RecordError::TooManyNodes`] if the node is new and the cap
    /// is reached.
    pub fn push(&mut self, status: Status) -> Result<()> {
        if status.node_name.is_empty() {
            return Err(RecordError::MissingNodeIdentity.into());
        }

        if let Some(nr) = self.nodes.get_mut(&status.node_name) {
            return nr.push(status);
        }

        if self.nodes.len() >= self.config.max_nodes {
            return Err(RecordError::TooManyNodes {
                max_nodes: self.config.max_nodes,
            }
            .into());
        }

        let node_name = status.node_name.clone();
        let mut nr = NodeRecorder::new(node_name.clone(), self.config.node_config())?
            .with_timestamper(Arc::clone(&self.timestamper));
        nr.push(status)?;
        tracing::debug!(node = %node_name, nodes = self.nodes.len() + 1, "tracking new node");
        self.nodes.insert(node_name, nr);
        Ok(())
    }

    /// Returns the maximum number of distinct nodes.
    pub fn max_nodes(&self) -> usize {
        self.config.max_nodes
    }

    /// Returns the capacity of each node recorder.
    pub fn capacity(&self) -> usize {
        self.config.node_capacity
    }

    /// Returns the size limit of each node recorder (0 = unlimited).
    pub fn max_size(&self) -> usize {
        self.config.max_size_per_node
    }

    /// Returns true if node recorders absorb duplicate consecutive fingerprints.
    pub fn is_coalescing(&self) -> bool {
        self.config.coalesce
    }

    /// Returns how many nodes are known.
    pub fn count_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Returns how many statuses are held for `node_name` (0 if unknown).
    pub fn count_records(&self, node_name: &str) -> usize {
        self.nodes.get(node_name).map_or(0, NodeRecorder::len)
    }

    /// Returns the total number of statuses across all nodes.
    pub fn len(&self) -> usize {
        self.nodes.values().map(NodeRecorder::len).sum()
    }

    /// Returns true if no status is held for any node.
    pub fn is_empty(&self) -> bool {
        self.nodes.values().all(NodeRecorder::is_empty)
    }

    /// Returns a copy of all the recorded statuses, by node name.
    pub fn content(&self) -> HashMap<String, Vec<RecordedStatus>> {
        self.nodes
            .iter()
            .map(|(name, nr)| (name.clone(), nr.content()))
            .collect()
    }

    /// Returns a copy of the statuses for `node_name` and whether it is known.
    ///
    /// An unknown node yields an empty list and `false`.
    pub fn content_for_node(&self, node_name: &str) -> (Vec<RecordedStatus>, bool) {
        match self.nodes.get(node_name) {
            Some(nr) => (nr.content(), true),
            None => (Vec::new(), false),
        }
    }
}
