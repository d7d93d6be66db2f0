//! Membership and leadership collaborators.
//!
//! `Membership` reports the current view and view changes.
//! `Leadership` says whether this node may orchestrate rebalances and
//! what the quorum size is. `CoordinatorLeadership` derives both from a
//! membership view and a voting set: the coordinator of a view holding a
//! majority of the voters leads.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use rotagrid_state::{MemberId, View};

/// Source of membership views for one member.
pub trait Membership: Send + Sync {
    fn current_view(&self) -> View;

    /// Receiver that is notified on every new view.
    fn subscribe(&self) -> watch::Receiver<View>;
}

/// Role of this node as seen by the leadership component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Leader,
}

/// Leader election / consensus collaborator.
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Receiver that is notified on every role transition.
    fn subscribe_role(&self) -> watch::Receiver<Role>;

    /// Minimum view size that may run items.
    fn quorum_size(&self) -> usize;

    /// Current voting set. Empty for components that do not expose one.
    fn voters(&self) -> Vec<MemberId> {
        Vec::new()
    }

    /// Add `member` to the voting set; `false` if nothing changed.
    fn add_voter(&self, _member: MemberId) -> bool {
        false
    }

    /// Remove `member` from the voting set; `false` if nothing changed.
    fn remove_voter(&self, _member: &MemberId) -> bool {
        false
    }
}

/// Majority threshold of a voting set.
pub fn majority(voters: usize) -> usize {
    voters / 2 + 1
}

/// Leadership derived from membership views.
///
/// The coordinator (first member) of a view is leader, but only while
/// the view holds a majority of the voting set. A minority partition
/// therefore has no leader at all. The voting set can change at runtime;
/// every member must apply the same changes.
pub struct CoordinatorLeadership {
    local: MemberId,
    membership: Arc<dyn Membership>,
    voters: Arc<watch::Sender<BTreeSet<MemberId>>>,
    role: Arc<watch::Sender<Role>>,
    follower: JoinHandle<()>,
}

impl CoordinatorLeadership {
    /// Start following `membership` on the current tokio runtime.
    pub fn spawn(
        local: MemberId,
        membership: Arc<dyn Membership>,
        voters: impl IntoIterator<Item = MemberId>,
    ) -> Self {
        let (voters, _rx) = watch::channel(voters.into_iter().collect::<BTreeSet<_>>());
        let voters = Arc::new(voters);
        let initial = role_for(&local, &membership.current_view(), quorum_of(&voters));
        let (tx, _rx) = watch::channel(initial);
        let role = Arc::new(tx);

        let mut views = membership.subscribe();
        let mut voting = voters.subscribe();
        let follower = tokio::spawn({
            let role = Arc::clone(&role);
            let local = local.clone();
            async move {
                loop {
                    tokio::select! {
                        Ok(()) = views.changed() => {}
                        Ok(()) = voting.changed() => {}
                        else => break,
                    }
                    let quorum = majority(voting.borrow_and_update().len());
                    let next = role_for(&local, &views.borrow_and_update(), quorum);
                    role.send_if_modified(|current| {
                        if *current == next {
                            return false;
                        }
                        info!(member = %local, from = ?*current, to = ?next, "role changed");
                        *current = next;
                        true
                    });
                }
                debug!(member = %local, "leadership follower stopped");
            }
        });

        Self {
            local,
            membership,
            voters,
            role,
            follower,
        }
    }
}

impl Leadership for CoordinatorLeadership {
    fn is_leader(&self) -> bool {
        role_for(&self.local, &self.membership.current_view(), self.quorum_size()) == Role::Leader
    }

    fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    fn quorum_size(&self) -> usize {
        quorum_of(&self.voters)
    }

    fn voters(&self) -> Vec<MemberId> {
        self.voters.borrow().iter().cloned().collect()
    }

    fn add_voter(&self, member: MemberId) -> bool {
        let local = &self.local;
        self.voters.send_if_modified(|voters| {
            let added = voters.insert(member.clone());
            if added {
                info!(%local, voter = %member, voters = voters.len(), "voter added");
            }
            added
        })
    }

    fn remove_voter(&self, member: &MemberId) -> bool {
        let local = &self.local;
        self.voters.send_if_modified(|voters| {
            let removed = voters.remove(member);
            if removed {
                info!(%local, voter = %member, voters = voters.len(), "voter removed");
            }
            removed
        })
    }
}

impl Drop for CoordinatorLeadership {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

fn quorum_of(voters: &watch::Sender<BTreeSet<MemberId>>) -> usize {
    majority(voters.borrow().len())
}

fn role_for(local: &MemberId, view: &View, quorum: usize) -> Role {
    if view.len() >= quorum && view.coordinator() == Some(local) {
        Role::Leader
    } else {
        Role::Follower
    }
}
