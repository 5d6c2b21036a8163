//! Collapse candidates that share a route fingerprint

use crate::proxy::models::{Candidate, Fingerprint};
use std::collections::HashMap;
use tracing::debug;

/// Keep the first candidate of every distinct fingerprint, in first-seen order.
///
/// Candidates without a fingerprint are dropped; earlier stages are expected
/// to have removed them already.
pub fn dedupe(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut groups: Vec<(Fingerprint, Vec<Candidate>)> = Vec::new();
    let mut index: HashMap<Fingerprint, usize> = HashMap::new();

    for candidate in candidates {
        let Some(fp) = candidate.fingerprint() else {
            debug!("{} has no fingerprint, skipped", candidate.name());
            continue;
        };
        match index.get(&fp) {
            Some(&i) => groups[i].1.push(candidate),
            None => {
                index.insert(fp, groups.len());
                groups.push((fp, vec![candidate]));
            }
        }
    }

    groups
        .into_iter()
        .filter_map(|(fp, mut group)| {
            if group.len() > 1 {
                let dropped: Vec<&str> = group[1..].iter().map(|c| c.name()).collect();
                debug!(
                    "duplicates of {} at {}: {}",
                    group[0].name(),
                    fp,
                    dropped.join(", ")
                );
            }
            group.truncate(1);
            group.pop()
        })
        .collect()
}
