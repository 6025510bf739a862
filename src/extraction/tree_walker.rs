//! Bounded ancestor search over a render tree.
//!
//! Iterative over the parent link with an explicit depth counter, so cyclic or
//! pathologically deep trees cannot recurse or loop forever.

use super::snapshot::{RenderTree, StateSlot};
use serde_json::Value;

pub const DEFAULT_MAX_DEPTH: usize = 30;

/// Where a walk stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkHit<'t, N> {
    pub node: N,
    /// Parent hops from the start node (0 = the start node itself).
    pub hops: usize,
    pub slot: StateSlot,
    pub value: &'t Value,
}

/// Visit at most `max_depth` nodes, starting at `start` and moving to each
/// parent, offering every candidate slot to `inspect` in [`StateSlot::ORDERED`]
/// order. Returns the first `inspect` hit together with where it was found.
pub fn walk_ancestors<'t, T, R, F>(
    tree: &'t T,
    start: T::Node,
    max_depth: usize,
    mut inspect: F,
) -> Option<(WalkHit<'t, T::Node>, R)>
where
    T: RenderTree,
    F: FnMut(StateSlot, &'t Value) -> Option<R>,
{
    let mut current = Some(start);
    let mut hops = 0usize;

    while let Some(node) = current {
        if hops >= max_depth {
            break;
        }
        for slot in StateSlot::ORDERED {
            let Some(value) = tree.slot(node, slot) else {
                continue;
            };
            if let Some(found) = inspect(slot, value) {
                return Some((
                    WalkHit {
                        node,
                        hops,
                        slot,
                        value,
                    },
                    found,
                ));
            }
        }
        current = tree.parent(node);
        hops += 1;
    }
    None
}

/// First slot value stored under `key` on `start` or one of its ancestors.
pub fn find_key<'t, T: RenderTree>(
    tree: &'t T,
    start: T::Node,
    key: &str,
    max_depth: usize,
) -> Option<WalkHit<'t, T::Node>> {
    walk_ancestors(tree, start, max_depth, |_, value| {
        value.as_object().and_then(|obj| obj.get(key))
    })
    .map(|(hit, found)| WalkHit {
        value: found,
        ..hit
    })
}
