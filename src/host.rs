//! Host tree boundary.
//!
//! The engine never owns the content tree it scans. Everything it needs from
//! the host is expressed through the [`HostTree`] trait: structural queries,
//! geometry, attachment checks, and a coarse fingerprint. Node references are
//! non-owning [`NodeId`] handles that the host may invalidate at any time, so
//! every dereference is preceded by an [`HostTree::is_attached`] check.
//!
//! [`MemoryTree`] is a complete in-memory implementation used by the test
//! suite and usable as a reference host.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;

/// Non-owning reference to a node in the host tree.
///
/// Must be re-validated with [`HostTree::is_attached`] before use; the host
/// may remove the underlying node at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Axis-aligned bounding rectangle in viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeRect {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Width in pixels.
    pub width: f64,
    /// Height in pixels.
    pub height: f64,
}

impl NodeRect {
    /// Creates a rectangle from its left/top corner and size.
    #[must_use]
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Bottom edge.
    #[must_use]
    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Right edge.
    #[must_use]
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    /// Returns this rectangle grown by `margin` on every side.
    #[must_use]
    pub fn expanded(&self, margin: f64) -> Self {
        Self {
            x: self.x - margin,
            y: self.y - margin,
            width: self.width + 2.0 * margin,
            height: self.height + 2.0 * margin,
        }
    }

    /// Whether the two rectangles overlap at all.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Fraction of this rectangle's area covered by `other`, in `[0, 1]`.
    #[must_use]
    pub fn coverage_by(&self, other: &Self) -> f64 {
        let ix = (self.right().min(other.right()) - self.x.max(other.x)).max(0.0);
        let iy = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0.0);
        let area = self.width * self.height;
        if area <= 0.0 {
            return 0.0;
        }
        // Rounding can push a full-span overlap a hair past 1.0.
        ((ix * iy) / area).min(1.0)
    }
}

/// The three host input signals the router multiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Vertical scroll of the viewport.
    Scroll,
    /// Viewport size change.
    Resize,
    /// Page/tab visibility change.
    Visibility,
}

/// Payload delivered to input handlers on each dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    /// Scroll tick with the current vertical scroll position.
    Scroll {
        /// Current scroll offset in pixels.
        position: f64,
    },
    /// Viewport resized.
    Resize {
        /// New viewport rectangle.
        viewport: NodeRect,
    },
    /// Page visibility changed.
    Visibility {
        /// Whether the page is now visible.
        visible: bool,
    },
}

impl InputEvent {
    /// The signal kind this event belongs to.
    #[must_use]
    pub const fn kind(&self) -> InputKind {
        match self {
            Self::Scroll { .. } => InputKind::Scroll,
            Self::Resize { .. } => InputKind::Resize,
            Self::Visibility { .. } => InputKind::Visibility,
        }
    }
}

/// Read-only access to the host-owned content tree.
///
/// Implementations are expected to be cheap for `is_attached`, `parent` and
/// `children`; the detector bounds how often it calls the rest.
pub trait HostTree {
    /// The document root.
    fn root(&self) -> NodeId;

    /// Parent of `node`, or `None` at the root or for detached nodes.
    fn parent(&self, node: NodeId) -> Option<NodeId>;

    /// Direct children of `node`, in document order.
    fn children(&self, node: NodeId) -> Vec<NodeId>;

    /// Lowercased tag name, or `None` for detached nodes.
    fn tag_name(&self, node: NodeId) -> Option<String>;

    /// Concatenated text of the node and its descendants.
    fn text_content(&self, node: NodeId) -> String;

    /// Whether the node is still part of the tree.
    fn is_attached(&self, node: NodeId) -> bool;

    /// Bounding rectangle in viewport coordinates, if the node is rendered.
    fn bounding_rect(&self, node: NodeId) -> Option<NodeRect>;

    /// Current viewport rectangle.
    fn viewport(&self) -> NodeRect;

    /// Tests `node` against a structural selector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSelector`] when the host cannot parse the
    /// selector. Callers treat this as recoverable and skip the selector.
    fn matches(&self, node: NodeId, selector: &str) -> Result<bool>;

    /// All attached nodes matching a structural selector, in document order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSelector`] for malformed selectors.
    fn query_all(&self, selector: &str) -> Result<Vec<NodeId>>;

    /// Count of attached element nodes; one half of the coarse fingerprint.
    fn element_count(&self) -> usize;

    /// Route identifier (URL path or equivalent); the other fingerprint half.
    fn route(&self) -> String;

    /// Whether the host can deliver mutation notifications.
    ///
    /// When `false`, the engine degrades to periodic polling instead of
    /// failing hard.
    fn supports_mutation_observation(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
struct NodeData {
    tag: String,
    classes: Vec<String>,
    id_attr: Option<String>,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    attached: bool,
    rect: Option<NodeRect>,
}

/// In-memory [`HostTree`] implementation.
///
/// Supports a simple selector language: `tag`, `.class`, `#id`. Anything
/// else is reported as malformed, which is exactly what the detector's
/// ignore-selector error path needs exercised.
///
/// Interior mutability lets tests mutate the tree while the engine holds an
/// `Rc<MemoryTree>`, mirroring a host that changes the page under us.
pub struct MemoryTree {
    nodes: RefCell<Vec<NodeData>>,
    viewport: RefCell<NodeRect>,
    route: RefCell<String>,
    mutation_observation: bool,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTree {
    /// Creates a tree holding a single `body` root and a 1280x800 viewport.
    #[must_use]
    pub fn new() -> Self {
        let root = NodeData {
            tag: "body".to_string(),
            classes: Vec::new(),
            id_attr: None,
            text: String::new(),
            parent: None,
            children: Vec::new(),
            attached: true,
            rect: Some(NodeRect::new(0.0, 0.0, 1280.0, 4000.0)),
        };
        Self {
            nodes: RefCell::new(vec![root]),
            viewport: RefCell::new(NodeRect::new(0.0, 0.0, 1280.0, 800.0)),
            route: RefCell::new("/".to_string()),
            mutation_observation: true,
        }
    }

    /// Creates a tree whose host cannot observe mutations.
    #[must_use]
    pub fn without_mutation_observation() -> Self {
        Self {
            mutation_observation: false,
            ..Self::new()
        }
    }

    /// Appends a child element under `parent` and returns its id.
    ///
    /// # Panics
    ///
    /// Panics if `parent` was never created by this tree.
    pub fn add_child(&self, parent: NodeId, tag: &str) -> NodeId {
        let mut nodes = self.nodes.borrow_mut();
        let id = NodeId(nodes.len() as u64);
        let attached = nodes[usize::try_from(parent.0).unwrap_or_default()].attached;
        nodes.push(NodeData {
            tag: tag.to_ascii_lowercase(),
            classes: Vec::new(),
            id_attr: None,
            text: String::new(),
            parent: Some(parent),
            children: Vec::new(),
            attached,
            rect: None,
        });
        nodes[usize::try_from(parent.0).unwrap_or_default()]
            .children
            .push(id);
        id
    }

    /// Sets the node's own text.
    pub fn set_text(&self, node: NodeId, text: &str) {
        if let Some(data) = self.nodes.borrow_mut().get_mut(node.0 as usize) {
            data.text = text.to_string();
        }
    }

    /// Sets the node's class list.
    pub fn set_classes(&self, node: NodeId, classes: &[&str]) {
        if let Some(data) = self.nodes.borrow_mut().get_mut(node.0 as usize) {
            data.classes = classes.iter().map(|c| (*c).to_string()).collect();
        }
    }

    /// Sets the node's id attribute.
    pub fn set_id_attr(&self, node: NodeId, id_attr: &str) {
        if let Some(data) = self.nodes.borrow_mut().get_mut(node.0 as usize) {
            data.id_attr = Some(id_attr.to_string());
        }
    }

    /// Sets the node's rendered bounding rectangle.
    pub fn set_rect(&self, node: NodeId, rect: NodeRect) {
        if let Some(data) = self.nodes.borrow_mut().get_mut(node.0 as usize) {
            data.rect = Some(rect);
        }
    }

    /// Detaches `node` and its whole subtree from the tree.
    pub fn remove(&self, node: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        if let Some(parent) = nodes.get(node.0 as usize).and_then(|d| d.parent) {
            if let Some(pd) = nodes.get_mut(parent.0 as usize) {
                pd.children.retain(|c| *c != node);
            }
        }
        let mut stack = vec![node];
        while let Some(next) = stack.pop() {
            if let Some(data) = nodes.get_mut(next.0 as usize) {
                data.attached = false;
                stack.extend(data.children.iter().copied());
            }
        }
    }

    /// Replaces the viewport rectangle.
    pub fn set_viewport(&self, viewport: NodeRect) {
        *self.viewport.borrow_mut() = viewport;
    }

    /// Replaces the route identifier.
    pub fn set_route(&self, route: &str) {
        *self.route.borrow_mut() = route.to_string();
    }

    fn matches_data(data: &NodeData, selector: &Selector) -> bool {
        match selector {
            Selector::Tag(tag) => data.tag == *tag,
            Selector::Class(class) => data.classes.iter().any(|c| c == class),
            Selector::IdAttr(id) => data.id_attr.as_deref() == Some(id.as_str()),
        }
    }
}

enum Selector {
    Tag(String),
    Class(String),
    IdAttr(String),
}

fn parse_selector(selector: &str) -> Result<Selector> {
    let invalid = |cause: &str| Error::InvalidSelector {
        selector: selector.to_string(),
        cause: cause.to_string(),
    };
    let trimmed = selector.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty selector"));
    }
    let (kind, name) = if let Some(rest) = trimmed.strip_prefix('.') {
        (1, rest)
    } else if let Some(rest) = trimmed.strip_prefix('#') {
        (2, rest)
    } else {
        (0, trimmed)
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("unsupported selector syntax"));
    }
    Ok(match kind {
        1 => Selector::Class(name.to_string()),
        2 => Selector::IdAttr(name.to_string()),
        _ => Selector::Tag(name.to_ascii_lowercase()),
    })
}

impl HostTree for MemoryTree {
    fn root(&self) -> NodeId {
        NodeId(0)
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        let nodes = self.nodes.borrow();
        let data = nodes.get(node.0 as usize)?;
        if data.attached { data.parent } else { None }
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        let nodes = self.nodes.borrow();
        nodes
            .get(node.0 as usize)
            .filter(|d| d.attached)
            .map(|d| d.children.clone())
            .unwrap_or_default()
    }

    fn tag_name(&self, node: NodeId) -> Option<String> {
        let nodes = self.nodes.borrow();
        let data = nodes.get(node.0 as usize)?;
        if data.attached {
            Some(data.tag.clone())
        } else {
            None
        }
    }

    fn text_content(&self, node: NodeId) -> String {
        let nodes = self.nodes.borrow();
        let mut out = String::new();
        let mut stack = vec![node];
        while let Some(next) = stack.pop() {
            if let Some(data) = nodes.get(next.0 as usize) {
                if !data.attached {
                    continue;
                }
                out.push_str(&data.text);
                // Reverse keeps document order under the LIFO stack.
                stack.extend(data.children.iter().rev().copied());
            }
        }
        out
    }

    fn is_attached(&self, node: NodeId) -> bool {
        self.nodes
            .borrow()
            .get(node.0 as usize)
            .is_some_and(|d| d.attached)
    }

    fn bounding_rect(&self, node: NodeId) -> Option<NodeRect> {
        let nodes = self.nodes.borrow();
        let data = nodes.get(node.0 as usize)?;
        if data.attached { data.rect } else { None }
    }

    fn viewport(&self) -> NodeRect {
        *self.viewport.borrow()
    }

    fn matches(&self, node: NodeId, selector: &str) -> Result<bool> {
        let parsed = parse_selector(selector)?;
        let nodes = self.nodes.borrow();
        Ok(nodes
            .get(node.0 as usize)
            .filter(|d| d.attached)
            .is_some_and(|d| Self::matches_data(d, &parsed)))
    }

    fn query_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        let parsed = parse_selector(selector)?;
        let nodes = self.nodes.borrow();
        Ok(nodes
            .iter()
            .enumerate()
            .filter(|(_, d)| d.attached && Self::matches_data(d, &parsed))
            .map(|(i, _)| NodeId(i as u64))
            .collect())
    }

    fn element_count(&self) -> usize {
        self.nodes.borrow().iter().filter(|d| d.attached).count()
    }

    fn route(&self) -> String {
        self.route.borrow().clone()
    }

    fn supports_mutation_observation(&self) -> bool {
        self.mutation_observation
    }
}
