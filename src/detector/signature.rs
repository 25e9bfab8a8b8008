//! Depth-bounded structural signatures.
//!
//! A signature is a histogram of descendant tag names down to a fixed depth,
//! rendered to a canonical string so equal structures compare with one string
//! equality. Two siblings with the same signature are presumed to be
//! instances of the same card template.

use crate::host::{HostTree, NodeId};
use std::collections::BTreeMap;

/// Computes the canonical signature of `node`.
///
/// The node's own tag is included at depth 0; descendants contribute up to
/// `depth` levels below it. `BTreeMap` keeps tag order stable so the
/// rendered form is canonical.
pub(crate) fn structural_signature(tree: &dyn HostTree, node: NodeId, depth: usize) -> String {
    let mut histogram: BTreeMap<String, u32> = BTreeMap::new();
    let mut frontier = vec![node];
    for _ in 0..=depth {
        if frontier.is_empty() {
            break;
        }
        let mut next = Vec::new();
        for current in frontier {
            if let Some(tag) = tree.tag_name(current) {
                *histogram.entry(tag).or_insert(0) += 1;
                next.extend(tree.children(current));
            }
        }
        frontier = next;
    }
    render(&histogram)
}

fn render(histogram: &BTreeMap<String, u32>) -> String {
    let mut out = String::new();
    for (tag, count) in histogram {
        if !out.is_empty() {
            out.push('|');
        }
        out.push_str(tag);
        out.push(':');
        out.push_str(&count.to_string());
    }
    out
}
