//! Wiring of the recorder, the collect loop, the dump loop and the HTTP server.
//!
//! [`setup`] is called once at process start. It owns nothing global: the
//! returned [`Collector`] carries the shared [`Environ`] and the channel
//! producers push into, so tests can run independent instances side by side.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::collect::{self, CollectStats};
use crate::config::Params;
use crate::dump;
use crate::error::{PfpStatusError, Result};
use crate::http;
use crate::record::{RecordedStatus, Recorder};
use crate::shutdown::Shutdown;
use crate::status::Status;

/// Number of statuses buffered between producers and the collect loop.
pub const STATUS_CHANNEL_CAPACITY: usize = 256;

/// The recorder behind the one lock shared by every reader and writer.
///
/// The lock lives here rather than inside [`Recorder`] so that the collect
/// loop, the dump loop and the HTTP handlers are strictly serialized against
/// each other. Readers copy what they need and release the lock before doing
/// any I/O.
#[derive(Debug)]
pub struct Environ {
    recorder: Mutex<Recorder>,
}

impl Environ {
    /// Wraps `recorder`.
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder: Mutex::new(recorder),
        }
    }

    /// Locks the recorder.
    ///
    /// # Errors
    ///
    /// Returns [`PfpStatusError::LockPoisoned`] if a previous holder panicked.
    pub fn lock(&self) -> Result<MutexGuard<'_, Recorder>> {
        self.recorder.lock().map_err(|_| PfpStatusError::LockPoisoned)
    }

    /// Pushes `status` while holding the lock.
    ///
    /// # Errors
    ///
    /// Returns the recorder's validation error, or
    /// [`PfpStatusError::LockPoisoned`].
    pub fn push(&self, status: Status) -> Result<()> {
        self.lock()?.push(status)
    }

    /// Returns the number of known nodes.
    ///
    /// # Errors
    ///
    /// Returns [`PfpStatusError::LockPoisoned`] if the lock is poisoned.
    pub fn count_nodes(&self) -> Result<usize> {
        Ok(self.lock()?.count_nodes())
    }

    /// Returns a copy of the content for `node_name` and whether it is known.
    ///
    /// # Errors
    ///
    /// Returns [`PfpStatusError::LockPoisoned`] if the lock is poisoned.
    pub fn content_for_node(&self, node_name: &str) -> Result<(Vec<RecordedStatus>, bool)> {
        Ok(self.lock()?.content_for_node(node_name))
    }

    /// Returns a copy of the content of every node.
    ///
    /// # Errors
    ///
    /// Returns [`PfpStatusError::LockPoisoned`] if the lock is poisoned.
    pub fn content(&self) -> Result<HashMap<String, Vec<RecordedStatus>>> {
        Ok(self.lock()?.content())
    }
}

/// Handle on a running set of loops created by [`setup`].
#[derive(Debug)]
pub struct Collector {
    env: Arc<Environ>,
    sender: SyncSender<Status>,
    shutdown: Shutdown,
    http_addr: Option<SocketAddr>,
    collect: JoinHandle<CollectStats>,
    workers: Vec<JoinHandle<()>>,
}

impl Collector {
    /// Returns a sender producers can push statuses into.
    pub fn sender(&self) -> SyncSender<Status> {
        self.sender.clone()
    }

    /// Returns the shared environment.
    pub fn env(&self) -> &Arc<Environ> {
        &self.env
    }

    /// Returns the address the HTTP server is bound to, if enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Returns a clone of the cancellation signal driving every loop.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Cancels every loop and waits for them to finish.
    ///
    /// Returns the collect loop counters.
    pub fn shutdown(self) -> CollectStats {
        self.shutdown.cancel();
        self.wait()
    }

    /// Waits for every loop to finish without cancelling them.
    ///
    /// The collect loop ends once every sender is dropped or the signal fires;
    /// the dump and serve loops only end on the signal.
    pub fn wait(self) -> CollectStats {
        let Self {
            sender,
            collect,
            workers,
            ..
        } = self;
        drop(sender);

        let stats = collect.join().unwrap_or_else(|_| {
            tracing::error!("collect loop panicked");
            CollectStats::default()
        });
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                tracing::error!(thread = %name, "loop panicked");
            }
        }
        stats
    }
}

/// Starts the enabled backends described by `params`.
///
/// Returns `Ok(None)` when neither HTTP nor dump is enabled: nothing would
/// ever read the recorder, so nothing is started.
///
/// # Errors
///
/// Returns an error if the recorder configuration is invalid, the HTTP
/// listener cannot be bound, or a thread cannot be spawned.
pub fn setup(params: Params) -> Result<Option<Collector>> {
    if !params.storage.enabled && !params.http.enabled {
        tracing::info!("no backend enabled, nothing to do");
        return Ok(None);
    }

    tracing::info!(?params, "setup in progress");

    let recorder = Recorder::new(params.recorder)?;
    let env = Arc::new(Environ::new(recorder));
    let shutdown = Shutdown::new();

    // bind first so a bad address does not leave loops running
    let server = if params.http.enabled {
        Some(http::Server::bind(&params.http.bind_addr())?)
    } else {
        None
    };
    let http_addr = server.as_ref().map(http::Server::local_addr);

    let (sender, receiver) = mpsc::sync_channel(STATUS_CHANNEL_CAPACITY);
    let collect = collect::spawn(Arc::clone(&env), receiver, shutdown.clone())?;

    let mut workers = Vec::new();
    if params.storage.enabled {
        workers.push(dump::spawn(
            Arc::clone(&env),
            params.storage.clone(),
            shutdown.clone(),
        )?);
    }
    if let Some(server) = server {
        let handler = http::pipeline(Arc::clone(&env), &params.http.middlewares);
        workers.push(server.spawn(handler, shutdown.clone())?);
    }

    Ok(Some(Collector {
        env,
        sender,
        shutdown,
        http_addr,
        collect,
        workers,
    }))
}
