//! # pfpstatus
//!
//! Bounded, in-memory history of pod fingerprint status events with an
//! authenticated HTTP query surface.
//!
//! A fingerprint engine running next to the scheduler emits a [`Status`]
//! every time it compares the expected pod fingerprint of a node with the one
//! it computed. pfpstatus keeps the most recent evidence for each node so
//! drift can be debugged after the fact, without ever growing past the
//! configured bounds.
//!
//! ## Key Properties
//!
//! - Two-level bounds: a global cap on distinct nodes and a per-node ring
//!   buffer capped by entry count and, optionally, by cumulative byte size
//! - Optional coalescing of consecutive statuses carrying the same fingerprints
//! - Single-writer collect loop fed by a channel, cooperative cancellation
//! - Read-only JSON endpoints behind a composable middleware chain
//! - Delegated authentication and authorization, with a loopback bypass
//!
//! ## Quick Start
//!
//! ```rust
//! use pfpstatus::{Recorder, RecorderConfig, Status};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut recorder = Recorder::new(RecorderConfig::default().with_node_capacity(3))?;
//!
//! for idx in 0..7 {
//!     recorder.push(Status::new("node-a").with_expected(format!("v{idx}")))?;
//! }
//!
//! let (entries, found) = recorder.content_for_node("node-a");
//! assert!(found);
//! let tags: Vec<_> = entries.iter().map(|e| e.status.fingerprint_expected.as_str()).collect();
//! assert_eq!(tags, ["v4", "v5", "v6"]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`NodeRecorder`]: FIFO ring buffer of [`RecordedStatus`] for one node
//! - [`Recorder`]: node name → [`NodeRecorder`] map with a node cap
//! - [`Environ`]: the recorder behind the single lock shared by all loops
//! - [`collect`]: channel-fed single writer
//! - [`http`]: listener, routing, handlers and middleware composition
//! - [`auth`]: bearer token middleware backed by an [`Authority`]
//!
//! ## Modules
//!
//! - [`status`]: status event data model
//! - [`record`]: bounded recorders
//! - [`collect`]: collect loop
//! - [`http`]: HTTP exposure layer
//! - [`auth`]: authentication/authorization middleware
//! - [`authority`]: external authority seam and API server client
//! - [`config`]: runtime parameters and environment overrides
//! - [`dump`]: periodic dump of the recorder content
//! - [`shutdown`]: cooperative cancellation signal
//! - [`setup`]: wiring of all the above
//! - [`error`]: error types

pub mod auth;
pub mod authority;
pub mod collect;
pub mod config;
pub mod dump;
pub mod error;
pub mod http;
pub mod record;
pub mod setup;
pub mod shutdown;
pub mod status;

// Re-export primary API types at crate root for convenience.
pub use auth::TokenBearerAuth;
pub use authority::{Authority, KubeAuthority, KubeAuthorityConfig};
pub use config::Params;
pub use error::{PfpStatusError, Result};
pub use http::{Handler, Middleware, Request, Response};
pub use record::{NodeRecorder, NodeRecorderConfig, RecordedStatus, Recorder, RecorderConfig};
pub use setup::{Collector, Environ, setup};
pub use shutdown::Shutdown;
pub use status::{NamespacedName, Status};
