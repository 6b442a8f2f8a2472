//! Stable per-container dot colors, persisted across CLI runs in
//! `$HOME/.kubetail/state/log-dot-colors.v1.json`. Writes are atomic
//! (temp + rename) under an on-disk directory lock: concurrent invocations
//! race for the same file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossterm::style::Color;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const STATE_FILE: &str = "log-dot-colors.v1.json";
const LOCK_DIR: &str = "log-dot-colors.lock";
const SCHEMA_VERSION: u32 = 1;
const ENTRY_TTL_DAYS: i64 = 30;
const LOCK_DEADLINE: Duration = Duration::from_secs(2);
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// A palette of visually distinct ANSI-256 values; `colorIndex` rotates
/// through it.
const PALETTE: [u8; 10] = [39, 208, 41, 199, 178, 51, 135, 161, 118, 214];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    #[serde(rename = "colorIndex")]
    color_index: u32,
    #[serde(rename = "lastSeenAt")]
    last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct State {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "nextColor")]
    next_color: u32,
    entries: HashMap<String, Entry>,
}

impl Default for State {
    fn default() -> Self {
        Self { schema_version: SCHEMA_VERSION, next_color: 0, entries: HashMap::new() }
    }
}

/// Handle over the persisted color assignments. `open` loads (resetting on
/// schema mismatch), `color_for` assigns, `close` sweeps expired entries and
/// writes back.
pub struct DotColors {
    dir: PathBuf,
    state: State,
    clock: fn() -> DateTime<Utc>,
}

impl DotColors {
    pub fn open(state_dir: &Path) -> Result<Self> {
        Self::open_with_clock(state_dir, Utc::now)
    }

    /// Test seam: inject the clock used for `lastSeenAt` and TTL sweeps.
    pub fn open_with_clock(state_dir: &Path, clock: fn() -> DateTime<Utc>) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("creating {}", state_dir.display()))?;
        let path = state_dir.join(STATE_FILE);
        let state = match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<State>(&raw) {
                Ok(s) if s.schema_version == SCHEMA_VERSION => s,
                Ok(s) => {
                    warn!(found = s.schema_version, "color state schema mismatch; resetting");
                    State::default()
                }
                Err(e) => {
                    warn!(error = %e, "color state unreadable; resetting");
                    State::default()
                }
            },
            Err(_) => State::default(),
        };
        Ok(Self { dir: state_dir.to_path_buf(), state, clock })
    }

    /// The stable color for a container id, assigning the next palette slot
    /// on first sight.
    pub fn color_for(&mut self, container_id: &str) -> Color {
        let now = (self.clock)();
        let next = &mut self.state.next_color;
        let entry = self
            .state
            .entries
            .entry(container_id.to_string())
            .or_insert_with(|| {
                let e = Entry { color_index: *next, last_seen_at: now };
                *next = next.wrapping_add(1);
                e
            });
        entry.last_seen_at = now;
        Color::AnsiValue(PALETTE[entry.color_index as usize % PALETTE.len()])
    }

    /// Sweeps entries unseen for 30 days and writes the file atomically.
    pub fn close(mut self) -> Result<()> {
        let now = (self.clock)();
        let cutoff = now - chrono::Duration::days(ENTRY_TTL_DAYS);
        let before = self.state.entries.len();
        self.state.entries.retain(|_, e| e.last_seen_at >= cutoff);
        if before != self.state.entries.len() {
            debug!(swept = before - self.state.entries.len(), "expired color entries removed");
        }

        let _lock = DirLock::acquire(&self.dir.join(LOCK_DIR))?;
        let path = self.dir.join(STATE_FILE);
        let tmp = self.dir.join(format!("{STATE_FILE}.tmp.{}", std::process::id()));
        let raw = serde_json::to_vec_pretty(&self.state).context("encoding color state")?;
        std::fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }
}

/// Directory-create mutex with a retry deadline; released on drop.
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(path: &Path) -> Result<Self> {
        let deadline = Instant::now() + LOCK_DEADLINE;
        loop {
            match std::fs::create_dir(path) {
                Ok(()) => return Ok(Self { path: path.to_path_buf() }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        anyhow::bail!("timed out waiting for lock {}", path.display());
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("creating lock {}", path.display()))
                }
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn ancient_now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_500_000_000, 0).unwrap()
    }

    #[test]
    fn colors_are_stable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut colors = DotColors::open(dir.path()).unwrap();
        let first = colors.color_for("containerd://aaa");
        let second = colors.color_for("containerd://bbb");
        assert_ne!(first, second);
        colors.close().unwrap();

        let mut colors = DotColors::open(dir.path()).unwrap();
        assert_eq!(colors.color_for("containerd://aaa"), first);
        assert_eq!(colors.color_for("containerd://bbb"), second);
    }

    #[test]
    fn schema_mismatch_resets_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(STATE_FILE),
            r#"{"schemaVersion": 99, "nextColor": 7, "entries": {}}"#,
        )
        .unwrap();
        let mut colors = DotColors::open(dir.path()).unwrap();
        // A reset state starts assigning from slot zero again.
        assert_eq!(colors.color_for("x"), Color::AnsiValue(PALETTE[0]));
    }

    #[test]
    fn stale_entries_are_swept_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut colors = DotColors::open_with_clock(dir.path(), ancient_now).unwrap();
        colors.color_for("old-container");
        colors.close().unwrap();

        // Reopen far in the future; the old entry ages out on close.
        let colors = DotColors::open_with_clock(dir.path(), fixed_now).unwrap();
        colors.close().unwrap();
        let raw = std::fs::read(dir.path().join(STATE_FILE)).unwrap();
        let state: State = serde_json::from_slice(&raw).unwrap();
        assert!(state.entries.is_empty());
    }

    #[test]
    fn lock_contention_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(LOCK_DIR);
        let _held = DirLock::acquire(&lock_path).unwrap();
        let err = DirLock::acquire(&lock_path);
        assert!(err.is_err());
    }

    #[test]
    fn palette_wraps_around() {
        let dir = tempfile::tempdir().unwrap();
        let mut colors = DotColors::open(dir.path()).unwrap();
        let first = colors.color_for("c-0");
        for i in 1..PALETTE.len() {
            colors.color_for(&format!("c-{i}"));
        }
        assert_eq!(colors.color_for("c-wrapped"), first);
    }
}
