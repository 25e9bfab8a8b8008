//! Container registry.
//!
//! Gives detector output a stable identity: containers keep their id across
//! re-scans, and child items keep theirs even as the host inserts or removes
//! nodes around them. Indices are monotonic per container and never reused,
//! so external references stay valid after earlier items disappear.

use crate::host::{HostTree, NodeId};
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace};

/// Process-unique, monotonically assigned container identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ContainerId(pub u64);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One tracked child of a container.
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    /// Stable id in the form `"<containerId>c<index>"`.
    pub id: String,
    /// Non-owning reference into the host tree.
    pub node: NodeId,
    /// Text captured once at creation; not kept live.
    pub text_snapshot: String,
    /// Whether the presentation layer currently hides this item.
    pub hidden: bool,
}

/// A detected cluster root and its tracked children.
#[derive(Debug, Clone, Serialize)]
pub struct Container {
    /// Stable identifier, never reassigned.
    pub id: ContainerId,
    /// Non-owning reference to the cluster root node.
    pub root: NodeId,
    /// Tracked children in creation order.
    pub children: Vec<Item>,
    next_index: u64,
}

/// Outcome of one [`ContainerRegistry::reconcile`] call.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Containers created this pass.
    pub created: Vec<ContainerId>,
    /// Pre-existing containers that gained children this pass.
    pub updated: Vec<ContainerId>,
    /// Containers silently dropped because their root detached.
    pub dropped: usize,
}

/// Serializable diagnostics snapshot of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// Count of live containers.
    pub total_containers: usize,
    /// Per-container detail.
    pub containers: Vec<ContainerSnapshot>,
}

/// One container in a [`RegistrySnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSnapshot {
    /// Container id.
    pub id: ContainerId,
    /// Tracked child count.
    pub child_count: usize,
    /// Child id/text pairs.
    pub children: Vec<ItemSnapshot>,
}

/// One item in a [`ContainerSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ItemSnapshot {
    /// Item id.
    pub id: String,
    /// Text snapshot captured at item creation.
    pub text: String,
}

#[derive(Default)]
struct RegistryState {
    containers: Vec<Container>,
    next_container_id: u64,
}

/// Maintains stable identities for containers and their children.
pub struct ContainerRegistry {
    tree: Rc<dyn HostTree>,
    state: RefCell<RegistryState>,
}

impl ContainerRegistry {
    /// Creates an empty registry over `tree`.
    #[must_use]
    pub fn new(tree: Rc<dyn HostTree>) -> Self {
        Self {
            tree,
            state: RefCell::new(RegistryState::default()),
        }
    }

    /// Folds a detector pass into the registry.
    ///
    /// Creates containers for unknown roots, refreshes children of known
    /// ones, and silently drops containers whose root node detached.
    pub fn reconcile(&self, roots: &[NodeId]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        {
            let mut state = self.state.borrow_mut();
            let before = state.containers.len();
            let tree = &self.tree;
            state.containers.retain(|c| tree.is_attached(c.root));
            outcome.dropped = before - state.containers.len();
            if outcome.dropped > 0 {
                debug!(dropped = outcome.dropped, "dropped containers with detached roots");
            }
        }

        for &root in roots {
            if !self.tree.is_attached(root) {
                continue;
            }
            let existing = self.get_by_element(root);
            match existing {
                Some(id) => {
                    if self.update_children(id) > 0 {
                        outcome.updated.push(id);
                    }
                }
                None => {
                    let id = {
                        let mut state = self.state.borrow_mut();
                        state.next_container_id += 1;
                        let id = ContainerId(state.next_container_id);
                        state.containers.push(Container {
                            id,
                            root,
                            children: Vec::new(),
                            next_index: 0,
                        });
                        id
                    };
                    self.update_children(id);
                    outcome.created.push(id);
                }
            }
        }

        metrics::gauge!("registry_containers").set(self.container_count() as f64);
        outcome
    }

    /// Re-derives the container's children from the live tree.
    ///
    /// Appends only nodes not already tracked, assigning the next unused
    /// index; indices are never reused even after node removal. Returns the
    /// number of items appended.
    pub fn update_children(&self, id: ContainerId) -> usize {
        let (root, known): (NodeId, Vec<NodeId>) = {
            let state = self.state.borrow();
            let Some(container) = state.containers.iter().find(|c| c.id == id) else {
                return 0;
            };
            (
                container.root,
                container.children.iter().map(|i| i.node).collect(),
            )
        };
        if !self.tree.is_attached(root) {
            return 0;
        }

        let mut appended = Vec::new();
        for child in self.tree.children(root) {
            if !known.contains(&child) {
                appended.push((child, self.tree.text_content(child)));
            }
        }

        let mut state = self.state.borrow_mut();
        let Some(container) = state.containers.iter_mut().find(|c| c.id == id) else {
            return 0;
        };
        let count = appended.len();
        for (node, text) in appended {
            let index = container.next_index;
            container.next_index += 1;
            container.children.push(Item {
                id: format!("{id}c{index}"),
                node,
                text_snapshot: text,
                hidden: false,
            });
        }
        if count > 0 {
            trace!(container = %id, appended = count, "children appended");
        }
        count
    }

    /// Container whose root is `node`, if tracked. O(n) over a bounded set.
    #[must_use]
    pub fn get_by_element(&self, node: NodeId) -> Option<ContainerId> {
        self.state
            .borrow()
            .containers
            .iter()
            .find(|c| c.root == node)
            .map(|c| c.id)
    }

    /// Clone of the container with the given id. O(n) over a bounded set.
    #[must_use]
    pub fn get_by_id(&self, id: ContainerId) -> Option<Container> {
        self.state
            .borrow()
            .containers
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Ids of all live containers, in creation order.
    #[must_use]
    pub fn container_ids(&self) -> Vec<ContainerId> {
        self.state.borrow().containers.iter().map(|c| c.id).collect()
    }

    /// Count of live containers.
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.state.borrow().containers.len()
    }

    /// Total tracked items across all containers.
    #[must_use]
    pub fn total_items(&self) -> usize {
        self.state
            .borrow()
            .containers
            .iter()
            .map(|c| c.children.len())
            .sum()
    }

    /// Flags an item as hidden or restored. Returns `false` for unknown ids.
    pub fn set_hidden(&self, item_id: &str, hidden: bool) -> bool {
        let mut state = self.state.borrow_mut();
        for container in &mut state.containers {
            if let Some(item) = container.children.iter_mut().find(|i| i.id == item_id) {
                item.hidden = hidden;
                return true;
            }
        }
        false
    }

    /// Serializable snapshot for diagnostics and external sync.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.borrow();
        RegistrySnapshot {
            total_containers: state.containers.len(),
            containers: state
                .containers
                .iter()
                .map(|c| ContainerSnapshot {
                    id: c.id,
                    child_count: c.children.len(),
                    children: c
                        .children
                        .iter()
                        .map(|i| ItemSnapshot {
                            id: i.id.clone(),
                            text: i.text_snapshot.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Destroys every container. The only path that ever removes ids.
    pub fn reset(&self) {
        let mut state = self.state.borrow_mut();
        debug!(containers = state.containers.len(), "registry reset");
        state.containers.clear();
    }
}
