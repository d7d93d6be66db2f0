//! Assignment of payloads to view members.
//!
//! The default strategy walks the canonical list once and hands out
//! targets in view order, wrapping from the last member back to the
//! first. Other strategies plug in through [`AssignmentStrategy`].

use rotagrid_state::{MemberId, Payload, View};

/// Cursor that selects indices in rotation.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the next index, wrapping around `count`.
    ///
    /// Returns `None` if count is zero.
    pub fn next(&mut self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter % count;
        self.counter += 1;
        Some(idx)
    }
}

/// Ordered (target, payload) pairs for one rebalance run.
#[derive(Debug, Clone)]
pub struct AssignmentPlan<P> {
    assignments: Vec<(MemberId, P)>,
}

impl<P> AssignmentPlan<P> {
    pub fn new(assignments: Vec<(MemberId, P)>) -> Self {
        Self { assignments }
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(MemberId, P)> {
        self.assignments.iter()
    }
}

impl<P> FromIterator<(MemberId, P)> for AssignmentPlan<P> {
    fn from_iter<I: IntoIterator<Item = (MemberId, P)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<P> IntoIterator for AssignmentPlan<P> {
    type Item = (MemberId, P);
    type IntoIter = std::vec::IntoIter<(MemberId, P)>;

    fn into_iter(self) -> Self::IntoIter {
        self.assignments.into_iter()
    }
}

/// Assign `payloads[i]` to `view.members()[i % k]`. An empty view
/// yields an empty plan.
pub fn round_robin<P: Payload>(payloads: &[P], view: &View) -> AssignmentPlan<P> {
    let members = view.members();
    let mut cursor = RoundRobin::new();
    let assignments = payloads
        .iter()
        .filter_map(|payload| {
            cursor
                .next(members.len())
                .map(|idx| (members[idx].clone(), payload.clone()))
        })
        .collect();
    AssignmentPlan { assignments }
}

/// Decides which member starts which payload after a stop round.
///
/// Implementations must place every payload at most once and only on
/// members of `view`; the coordinator sends starts in plan order.
pub trait AssignmentStrategy<P: Payload>: Send + Sync {
    fn plan(&self, payloads: &[P], view: &View) -> AssignmentPlan<P>;
}

/// [`round_robin`] as a strategy. Used unless a node is given another.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinStrategy;

impl<P: Payload> AssignmentStrategy<P> for RoundRobinStrategy {
    fn plan(&self, payloads: &[P], view: &View) -> AssignmentPlan<P> {
        round_robin(payloads, view)
    }
}
