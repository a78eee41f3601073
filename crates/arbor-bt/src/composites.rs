use crate::node::{ChildSelection, CompositeNode, LastChild, NodeResult};

/// Runs children in order until one succeeds.
///
/// Succeeds with the first succeeding child, fails when every child failed or was skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Selector;

impl CompositeNode for Selector {
    fn next_child(&self, last: LastChild, num_children: usize) -> ChildSelection {
        let next = match last {
            LastChild::None => 0,
            LastChild::Finished {
                result: NodeResult::Succeeded,
                ..
            } => return ChildSelection::Return(NodeResult::Succeeded),
            LastChild::Finished { index, .. } | LastChild::Skipped { index } => index + 1,
        };
        if next < num_children {
            ChildSelection::Child(next)
        } else {
            ChildSelection::Return(NodeResult::Failed)
        }
    }
}

/// Runs children in order until one fails.
///
/// A child blocked by its decorators is skipped, not treated as a failure. Lower-priority
/// aborts are not supported: earlier children of a sequence already succeeded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequence;

impl CompositeNode for Sequence {
    fn next_child(&self, last: LastChild, num_children: usize) -> ChildSelection {
        let next = match last {
            LastChild::None => 0,
            LastChild::Finished {
                result: NodeResult::Failed | NodeResult::Aborted,
                ..
            } => return ChildSelection::Return(NodeResult::Failed),
            LastChild::Finished { index, .. } | LastChild::Skipped { index } => index + 1,
        };
        if next < num_children {
            ChildSelection::Child(next)
        } else {
            ChildSelection::Return(NodeResult::Succeeded)
        }
    }

    fn allows_lower_priority_abort(&self) -> bool {
        false
    }
}
