//! Line-delimited JSON status input.
//!
//! Each non-blank line is one [`Status`] object. Lines that do not parse are
//! logged and skipped so one bad producer cannot stall the collector.

use std::io::BufRead;
use std::sync::mpsc::SyncSender;

use pfpstatus::Status;

/// Counters reported once the input is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Statuses handed to the channel.
    pub sent: u64,
    /// Lines that could not be parsed.
    pub skipped: u64,
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<Result<Status, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line))
}

/// Forwards every status read from `reader` into `sender`.
///
/// Stops at end of input, on a read error, or once the receiving side is
/// gone.
pub fn forward<R: BufRead>(reader: R, sender: &SyncSender<Status>) -> ForwardStats {
    let mut stats = ForwardStats::default();
    for (lineno, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "reading input");
                break;
            }
        };
        match parse_line(&line) {
            None => {}
            Some(Ok(status)) => {
                if sender.send(status).is_err() {
                    tracing::warn!("collector gone, stop reading input");
                    break;
                }
                stats.sent += 1;
            }
            Some(Err(e)) => {
                stats.skipped += 1;
                tracing::warn!(line = lineno + 1, error = %e, "skipping malformed status");
            }
        }
    }
    tracing::info!(sent = stats.sent, skipped = stats.skipped, "input exhausted");
    stats
}
