//! Crash reclassification against trigger content.
//!
//! A crash definition may carry more specific children; the trigger file's
//! content decides which one actually fired. Classification failure is
//! terminal for the single event being processed, never for the agent.

use crate::config::CrashSpec;
use crate::error::{ProbeError, Result};
use std::path::Path;

/// Result of classification: the (possibly more specific) crash identity
/// plus up to three auxiliary data fields for the history annotation and
/// telemetry class string.
#[derive(Debug)]
pub struct Classified<'a> {
    pub spec: &'a CrashSpec,
    pub data: [Option<String>; 3],
}

/// Inspect the trigger content and pick the most specific matching crash.
///
/// Children are tried depth-first in configuration order; a child matches
/// when every one of its `content` substrings appears in the trigger
/// content (a child with no rules never matches). With no trigger file
/// there is no content to inspect and the crash stays as detected.
pub fn reclassify<'a>(crash: &'a CrashSpec, trigger_file: Option<&Path>) -> Result<Classified<'a>> {
    let content = match trigger_file {
        Some(path) => {
            Some(std::fs::read_to_string(path).map_err(|e| ProbeError::ClassifyFailed {
                crash: crash.name.clone(),
                reason: format!("cannot read trigger {}: {}", path.display(), e),
            })?)
        }
        None => None,
    };

    let spec = match &content {
        Some(text) => refine(crash, text),
        None => crash,
    };

    let data = match &content {
        Some(text) => extract_data(spec, text),
        None => [None, None, None],
    };

    Ok(Classified { spec, data })
}

fn refine<'a>(crash: &'a CrashSpec, content: &str) -> &'a CrashSpec {
    for child in &crash.children {
        if !child.content.is_empty() && child.content.iter().all(|needle| content.contains(needle))
        {
            return refine(child, content);
        }
    }
    crash
}

fn extract_data(spec: &CrashSpec, content: &str) -> [Option<String>; 3] {
    let mut data = [None, None, None];
    for (slot, prefix) in spec.data.iter().take(3).enumerate() {
        data[slot] = content
            .lines()
            .find_map(|line| line.strip_prefix(prefix.as_str()))
            .map(|rest| rest.trim().to_string());
    }
    data
}
