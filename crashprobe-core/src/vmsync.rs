//! Guest VM event synchronization.
//!
//! Each sweep reads a guest's event stream and feeds the lines past the
//! persisted resume cursor to a per-sender handler. A line is consumed only
//! when the handler reports [`Outcome::Handled`]; [`Outcome::Defer`] stops
//! the sweep with the cursor unmoved, so the same line is retried on the
//! next sweep (at-least-once, not exactly-once).

use crate::error::{ProbeError, Result};
use crate::guest::GuestImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Tokens longer than this make a line malformed; the original fixed-width
/// scan buffers become an explicit bound here.
const MAX_TOKEN_LEN: usize = 32;
/// Bound on the free-form remainder.
const MAX_REST_LEN: usize = 4096;

/// Marker inside the remainder that names a guest-relative log directory.
pub const LOG_MARKER: &str = "/logs/";

/// Per-line outcome of one synchronization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Terminal for the line; the resume cursor advances past it.
    Handled,
    /// Retry the same line on the next sweep; the cursor does not move.
    Defer,
}

/// One parsed guest event line: `EVENT KEY LONGTIME TYPE REST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLine {
    pub event: String,
    pub key: String,
    pub longtime: String,
    pub kind: String,
    pub rest: String,
}

impl VmLine {
    /// The `/logs/<relative-path>` reference embedded in the remainder, if
    /// any, starting at the marker.
    pub fn log_target(&self) -> Option<&str> {
        self.rest.find(LOG_MARKER).map(|at| &self.rest[at..])
    }
}

fn take_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}

/// Parse one event line against the five-field grammar. Oversized fields
/// are rejected explicitly rather than truncated.
pub fn parse_line(line: &str) -> Option<VmLine> {
    let mut remainder = line;
    let mut tokens = [""; 4];
    for slot in tokens.iter_mut() {
        let (token, rest) = take_token(remainder)?;
        if token.len() > MAX_TOKEN_LEN {
            return None;
        }
        *slot = token;
        remainder = rest;
    }
    let rest = remainder.trim();
    if rest.is_empty() || rest.len() > MAX_REST_LEN {
        return None;
    }
    Some(VmLine {
        event: tokens[0].to_string(),
        key: tokens[1].to_string(),
        longtime: tokens[2].to_string(),
        kind: tokens[3].to_string(),
        rest: rest.to_string(),
    })
}

/// Persisted per-(sender, VM) resume cursors, keyed by VM name and holding
/// the key of the last consumed line.
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    cursors: HashMap<String, String>,
}

impl CursorStore {
    /// Load the cursor file, starting empty when it does not exist yet. A
    /// corrupt file is discarded with a warning: losing cursors only means
    /// reprocessing, which the at-least-once model already tolerates.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cursors = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("corrupt cursor file ({}), starting over: {}", path.display(), e);
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(ProbeError::io(&path, e)),
        };
        Ok(Self { path, cursors })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key of the last consumed line for this VM.
    pub fn last(&self, vm: &str) -> Option<&str> {
        self.cursors.get(vm).map(String::as_str)
    }

    /// Advance past `key` and persist immediately so a restart resumes
    /// from the right place.
    pub fn advance(&mut self, vm: &str, key: &str) -> Result<()> {
        self.cursors.insert(vm.to_string(), key.to_string());
        let content = serde_json::to_string_pretty(&self.cursors)
            .map_err(|e| ProbeError::Internal(e.to_string()))?;
        std::fs::write(&self.path, content).map_err(|e| ProbeError::io(&self.path, e))
    }
}

/// Run one sweep for a (sender, VM) pair.
///
/// Malformed lines are logged and consumed here so they can never block the
/// stream; well-formed lines go to `handler`. The sweep stops at the first
/// DEFER so the cursor never advances past an unconsumed line.
pub fn sweep<F>(
    image: &dyn GuestImage,
    stream_dpath: &str,
    vm_name: &str,
    cursors: &mut CursorStore,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&VmLine) -> Outcome,
{
    let content = image.read_file(stream_dpath)?;

    // Resume after the last consumed key; if it vanished (guest rotated its
    // stream), start over from the top.
    let mut skipping = cursors.last(vm_name).map(str::to_string);
    let mut deferred = 0usize;

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = parse_line(line);
        if let Some(last_key) = &skipping {
            if let Some(parsed) = &parsed {
                if parsed.key == *last_key {
                    skipping = None;
                }
            }
            continue;
        }
        let Some(parsed) = parsed else {
            warn!("got an invalid line from ({}), skip", vm_name);
            continue;
        };
        match handler(&parsed) {
            Outcome::Handled => cursors.advance(vm_name, &parsed.key)?,
            Outcome::Defer => {
                deferred += 1;
                warn!("deferred line ({}) from ({}), will retry", parsed.key, vm_name);
                break;
            }
        }
    }

    if skipping.is_some() {
        // Cursor key no longer present; reprocess from the top next sweep.
        debug!("cursor for ({}) not found in stream, will restart", vm_name);
    }
    if deferred == 0 {
        debug!("sweep of ({}) complete", vm_name);
    }
    Ok(())
}
