use std::collections::HashSet;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use anyhow::Result;

use crate::models::blockchain::Sha256dHash;
use crate::models::state::TuiLogger;
use crate::rdns;

/// Append-only first-seen log. Every block hash is recorded at most once for
/// the lifetime of the process, no matter how many paths observe it.
pub struct RelayLog {
    inner: Mutex<RelayLogInner>,
    logger: TuiLogger,
}

struct RelayLogInner {
    file: File,
    block_relayed: HashSet<Sha256dHash>,
}

impl RelayLog {
    pub fn open(path: &Path, logger: TuiLogger) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open relay log {}", path.display()))?;
        Ok(Self {
            inner: Mutex::new(RelayLogInner {
                file,
                block_relayed: HashSet::new(),
            }),
            logger,
        })
    }

    /// Record the first observation of `hash`: one line in the log file, one
    /// line in the TUI queue, plus any accumulated relay-peer stats lines.
    /// Later observations of the same hash are suppressed globally.
    pub async fn log_block_relay(
        &self,
        hash: Sha256dHash,
        source: &str,
        remote: IpAddr,
        stats_lines: Option<&str>,
    ) {
        let time_relayed = ms_since_epoch();
        if self.lock().block_relayed.contains(&hash) {
            return;
        }

        // Resolved before re-taking the lock; the lookup may take a while.
        let rdns = rdns::get_rdns(remote).await;

        let mut inner = self.lock();
        if !inner.block_relayed.insert(hash) {
            return;
        }

        let source = format!("{source} from {remote}/{rdns}");
        self.logger
            .log_line(format!("{} relayed ({}) {}", abbreviated(hash), source, time_relayed));

        let mut entry = format!("{hash} {time_relayed} {source}\n");
        if let Some(stats) = stats_lines {
            if !stats.is_empty() {
                entry.push_str(stats);
                if !stats.ends_with('\n') {
                    entry.push('\n');
                }
            }
        }

        let written = inner
            .file
            .write_all(entry.as_bytes())
            .and_then(|()| inner.file.flush());
        if let Err(e) = written {
            eprintln!("Failed to write to relay log: {e}");
            std::process::exit(1);
        }
    }

    pub fn times_logged(&self) -> usize {
        self.lock().block_relayed.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayLogInner> {
        self.inner
            .lock()
            .unwrap_or_else(|e| panic!("Failed to lock relay log: {}", e))
    }
}

fn ms_since_epoch() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Middle slice of the hex hash, enough to eyeball in the console without
/// flooding it.
fn abbreviated(hash: Sha256dHash) -> String {
    hex::encode(hash.as_bytes())[4..32].to_owned()
}
