//! Shared fixtures for the integration suites.
//!
//! Builds small card-cluster trees on [`MemoryTree`], the in-memory host
//! implementation, mirroring the markup shape the detector is tuned for.

// Not every suite uses every helper.
#![allow(dead_code)]

use cardscan::{HostTree, MemoryTree, NodeId};
use std::rc::Rc;

/// Builds `body > div (feed) > N article(h2, p)` with per-card text.
pub fn feed_tree(cards: usize) -> (Rc<MemoryTree>, NodeId) {
    let tree = Rc::new(MemoryTree::new());
    let feed = tree.add_child(tree.root(), "div");
    for i in 0..cards {
        add_card(&tree, feed, &format!("card number {i} with plenty of text"));
    }
    (tree, feed)
}

/// Appends one `article(h2, p)` card with the given text under `feed`.
pub fn add_card(tree: &MemoryTree, feed: NodeId, text: &str) -> NodeId {
    let card = tree.add_child(feed, "article");
    tree.set_text(card, text);
    tree.add_child(card, "h2");
    tree.add_child(card, "p");
    card
}
