//! Hierarchical progress tracking.
//!
//! A build owns one root [`ProgressAllocation`]. Every step receives a child
//! that owns a share of its parent's units, and may split that share further.
//! Progress events report the fraction of the whole build each update
//! completes, so a consumer only has to sum them.

use std::sync::{Arc, Weak};

use kiln_common::{KilnError, KilnResult};
use parking_lot::Mutex;

use crate::events::{BuildEvent, EventHandlers};

struct Node {
    description: String,
    units: u64,
    /// Fraction of the root that this node's whole allocation represents.
    share_of_root: f64,
    parent: Weak<Node>,
    events: EventHandlers,
    state: Mutex<NodeState>,
}

#[derive(Default)]
struct NodeState {
    allocated: u64,
    completed: u64,
    closed: bool,
    children: Vec<Arc<Node>>,
}

impl NodeState {
    /// Units neither handed to children nor completed.
    const fn available(&self, units: u64) -> u64 {
        units - self.allocated - self.completed
    }
}

/// A node in the progress tree.
#[derive(Clone)]
pub struct ProgressAllocation {
    node: Arc<Node>,
}

impl std::fmt::Debug for ProgressAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.node.state.lock();
        f.debug_struct("ProgressAllocation")
            .field("description", &self.node.description)
            .field("units", &self.node.units)
            .field("completed", &state.completed)
            .field("allocated", &state.allocated)
            .finish()
    }
}

impl ProgressAllocation {
    /// Create the root of a progress tree.
    #[must_use]
    pub fn root(description: impl Into<String>, units: u64, events: EventHandlers) -> Self {
        Self {
            node: Arc::new(Node {
                description: description.into(),
                units,
                share_of_root: 1.0,
                parent: Weak::new(),
                events,
                state: Mutex::new(NodeState::default()),
            }),
        }
    }

    /// Hand `share` of this node's units to a new child that tracks `units` of its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the shares handed out would exceed this node's units.
    pub fn allocate(
        &self,
        description: impl Into<String>,
        share: u64,
        units: u64,
    ) -> KilnResult<Self> {
        let description = description.into();
        let mut state = self.node.state.lock();
        let available = state.available(self.node.units);
        if share > available {
            return Err(KilnError::internal(format!(
                "progress allocation '{description}' wants {share} units but '{}' has {available} of {} left",
                self.node.description, self.node.units
            )));
        }
        state.allocated += share;

        #[allow(clippy::cast_precision_loss)]
        let share_of_root = if self.node.units == 0 {
            0.0
        } else {
            self.node.share_of_root * share as f64 / self.node.units as f64
        };
        let child = Arc::new(Node {
            description,
            units,
            share_of_root,
            parent: Arc::downgrade(&self.node),
            events: self.node.events.clone(),
            state: Mutex::new(NodeState::default()),
        });
        state.children.push(Arc::clone(&child));
        Ok(Self { node: child })
    }

    /// Mark `units` more units complete, clamped to what remains.
    ///
    /// Units handed to children cannot be completed here.
    pub fn complete(&self, units: u64) {
        let added = {
            let mut state = self.node.state.lock();
            if state.closed {
                return;
            }
            let added = units.min(state.available(self.node.units));
            state.completed += added;
            added
        };
        if added > 0 {
            self.emit(added);
        }
    }

    /// Complete everything that remains here and in every descendant.
    ///
    /// Closing twice is harmless.
    pub fn close(&self) {
        let children = self.node.state.lock().children.clone();
        for child in children {
            Self { node: child }.close();
        }

        let remaining = {
            let mut state = self.node.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let remaining = state.available(self.node.units);
            state.completed += remaining;
            remaining
        };
        if remaining > 0 {
            self.emit(remaining);
        } else if self.node.units == 0 && self.node.share_of_root > 0.0 {
            self.dispatch(self.node.share_of_root);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn emit(&self, units: u64) {
        let own_fraction = self.node.share_of_root * units as f64 / self.node.units as f64;
        self.dispatch(own_fraction);
    }

    fn dispatch(&self, fraction: f64) {
        self.node.events.dispatch(&BuildEvent::Progress {
            allocation: self.path(),
            fraction,
        });
    }

    /// Descriptions from the root down to this node, joined with ` > `.
    #[must_use]
    pub fn path(&self) -> String {
        let mut parts = vec![self.node.description.clone()];
        let mut parent = self.node.parent.upgrade();
        while let Some(node) = parent {
            parts.push(node.description.clone());
            parent = node.parent.upgrade();
        }
        parts.reverse();
        parts.join(" > ")
    }

    /// Description of this node.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.node.description
    }

    /// Units this node tracks.
    #[must_use]
    pub fn units(&self) -> u64 {
        self.node.units
    }

    /// Units completed directly on this node.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.node.state.lock().completed
    }

    /// Units handed to children.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.node.state.lock().allocated
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.node.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::*;
    use crate::events::EventSink;

    #[derive(Default)]
    struct Total(Mutex<f64>);

    impl EventSink for Arc<Total> {
        fn dispatch(&self, event: &BuildEvent) {
            if let BuildEvent::Progress { fraction, .. } = event {
                *self.0.lock() += fraction;
            }
        }
    }

    fn tracked_root(units: u64) -> (ProgressAllocation, Arc<Total>) {
        let total = Arc::new(Total::default());
        let root = ProgressAllocation::root(
            "build",
            units,
            EventHandlers::none().with(Arc::clone(&total)),
        );
        (root, total)
    }

    #[test]
    fn over_allocation_is_rejected() {
        let (root, _) = tracked_root(2);
        root.allocate("a", 1, 10).unwrap();
        root.allocate("b", 1, 10).unwrap();
        assert!(root.allocate("c", 1, 10).is_err());
        assert_eq!(root.allocated(), 2);
    }

    #[test]
    fn completion_is_clamped_and_monotonic() {
        let (root, total) = tracked_root(1);
        let child = root.allocate("layer", 1, 100).unwrap();
        child.complete(60);
        child.complete(60);
        assert_eq!(child.completed(), 100);
        assert!((*total.0.lock() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn close_finishes_whole_tree() {
        let (root, total) = tracked_root(4);
        let pull = root.allocate("pull", 2, 3).unwrap();
        let layer = pull.allocate("layer", 3, 1000).unwrap();
        layer.complete(500);
        root.allocate("push", 1, 0).unwrap();

        root.close();
        assert!(layer.is_closed());
        assert!((*total.0.lock() - 1.0).abs() < 1e-9);

        // Nothing more is reported after closing.
        layer.complete(10);
        assert!((*total.0.lock() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn path_names_ancestors() {
        let (root, _) = tracked_root(1);
        let child = root.allocate("pull base layers", 1, 1).unwrap();
        let leaf = child.allocate("layer 0", 1, 1).unwrap();
        assert_eq!(leaf.path(), "build > pull base layers > layer 0");
    }

    proptest! {
        #[test]
        fn reported_total_never_exceeds_one(
            shares in proptest::collection::vec((1u64..5, 0u64..50, 0u64..80), 1..8)
        ) {
            let root_units: u64 = shares.iter().map(|(share, _, _)| share).sum();
            let (root, total) = tracked_root(root_units);
            for (share, units, done) in &shares {
                let child = root.allocate("child", *share, *units).unwrap();
                child.complete(*done);
                prop_assert!(child.completed() <= *units);
            }
            prop_assert!(*total.0.lock() <= 1.0 + 1e-9);
            root.close();
            prop_assert!((*total.0.lock() - 1.0).abs() < 1e-9);
        }
    }
}
