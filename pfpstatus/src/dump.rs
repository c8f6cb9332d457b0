//! Periodic dump of the recorder content to a directory.
//!
//! Each dump writes one `<node>.json` file per known node, holding the same
//! JSON array the per-node HTTP endpoint returns. Files are written to a
//! temporary name and renamed into place, so readers never see a partial
//! file. The dump is a debugging aid: failures are logged and the next period
//! tries again.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::StorageParams;
use crate::error::{DumpError, Result, ServeError};
use crate::record::RecordedStatus;
use crate::setup::Environ;
use crate::shutdown::Shutdown;

/// Extension of the per-node dump files.
pub const DUMP_EXTENSION: &str = "json";

/// Writes the content of every node into `directory`.
///
/// Returns how many node files were written. Nodes whose name is not a safe
/// file name, or whose file cannot be written, are skipped with a warning.
///
/// # Errors
///
/// Returns [`DumpError::MissingDirectory`] if `directory` does not exist, or
/// [`crate::PfpStatusError::LockPoisoned`] if the recorder cannot be read.
pub fn dump_once(env: &Environ, directory: &Path) -> Result<usize> {
    if !directory.is_dir() {
        return Err(DumpError::MissingDirectory {
            path: directory.to_path_buf(),
        }
        .into());
    }

    // copy under the lock, write without it
    let content = env.content()?;

    let mut written = 0;
    for (node, entries) in &content {
        if !is_safe_file_name(node) {
            tracing::warn!(node = %node, "skipping node with unsafe file name");
            continue;
        }
        match write_node(directory, node, entries) {
            Ok(_) => written += 1,
            Err(e) => tracing::warn!(node = %node, error = %e, "cannot dump node"),
        }
    }
    Ok(written)
}

/// Returns the path of the dump file for `node` in `directory`.
pub fn node_file(directory: &Path, node: &str) -> PathBuf {
    directory.join(format!("{node}.{DUMP_EXTENSION}"))
}

/// Serializes `entries` into the dump file of `node`.
fn write_node(
    directory: &Path,
    node: &str,
    entries: &[RecordedStatus],
) -> std::result::Result<PathBuf, DumpError> {
    let data = serde_json::to_vec(entries).map_err(|source| DumpError::Serialize {
        node: node.to_string(),
        source,
    })?;

    let path = node_file(directory, node);
    let tmp = directory.join(format!(".{node}.{DUMP_EXTENSION}.tmp"));
    fs::write(&tmp, &data).map_err(|source| DumpError::Write {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, &path).map_err(|source| DumpError::Write {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Returns true if `name` can be used as a file name without escaping.
fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Dumps every `params.period` until `shutdown` fires.
pub fn dump_loop(env: &Environ, params: &StorageParams, shutdown: &Shutdown) {
    tracing::debug!(directory = %params.directory.display(), period = ?params.period, "dump loop started");
    while shutdown.sleep(params.period) {
        match dump_once(env, &params.directory) {
            Ok(nodes) => tracing::debug!(nodes, "dumped pfpstatus"),
            Err(e) => tracing::warn!(error = %e, "dump failed"),
        }
    }
    tracing::debug!("dump loop finished");
}

/// Runs [`dump_loop`] on a dedicated thread.
///
/// # Errors
///
/// Returns [`ServeError::Spawn`] if the thread cannot be created.
pub fn spawn(env: Arc<Environ>, params: StorageParams, shutdown: Shutdown) -> Result<JoinHandle<()>> {
    let name = "pfpstatus-dump".to_string();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || dump_loop(&env, &params, &shutdown))
        .map_err(|source| ServeError::Spawn { name, source }.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PfpStatusError;
    use crate::record::{Recorder, RecorderConfig};
    use crate::status::Status;
    use std::time::Duration;
    use tempfile::tempdir;

    fn environ() -> Environ {
        Environ::new(Recorder::new(RecorderConfig::default().with_node_capacity(4)).unwrap())
    }

    #[test]
    fn test_dump_once_writes_one_file_per_node() {
        let dir = tempdir().unwrap();
        let env = environ();
        env.push(Status::new("node-0").with_expected("a")).unwrap();
        env.push(Status::new("node-0").with_expected("b")).unwrap();
        env.push(Status::new("node-1.example.com")).unwrap();

        assert_eq!(dump_once(&env, dir.path()).unwrap(), 2);

        let data = fs::read(node_file(dir.path(), "node-0")).unwrap();
        let entries: Vec<RecordedStatus> = serde_json::from_slice(&data).unwrap();
        let tags: Vec<_> = entries
            .iter()
            .map(|e| e.status.fingerprint_expected.as_str())
            .collect();
        assert_eq!(tags, ["a", "b"]);
        assert!(node_file(dir.path(), "node-1.example.com").exists());

        // no temporary file left behind
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_dump_once_skips_unsafe_names() {
        let dir = tempdir().unwrap();
        let env = environ();
        env.push(Status::new("../escape")).unwrap();
        env.push(Status::new("node-0")).unwrap();

        assert_eq!(dump_once(&env, dir.path()).unwrap(), 1);
        assert!(!dir.path().parent().unwrap().join("escape.json").exists());
    }

    #[test]
    fn test_dump_once_missing_directory() {
        let dir = tempdir().unwrap();
        let err = dump_once(&environ(), &dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, PfpStatusError::Dump(DumpError::MissingDirectory { .. })));
    }

    #[test]
    fn test_dump_loop_runs_until_cancelled() {
        let dir = tempdir().unwrap();
        let env = Arc::new(environ());
        env.push(Status::new("node-0")).unwrap();

        let params = StorageParams {
            enabled: true,
            directory: dir.path().to_path_buf(),
            period: Duration::from_millis(10),
        };
        let shutdown = Shutdown::new();
        let handle = spawn(Arc::clone(&env), params, shutdown.clone()).unwrap();

        let file = node_file(dir.path(), "node-0");
        while !file.exists() {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.cancel();
        handle.join().unwrap();
    }

    #[test]
    fn test_safe_file_names() {
        assert!(is_safe_file_name("worker-0.example_com"));
        assert!(!is_safe_file_name(""));
        assert!(!is_safe_file_name(".hidden"));
        assert!(!is_safe_file_name("a/b"));
    }
}
