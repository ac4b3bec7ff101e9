use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::time::Instant;

use crate::event::MemberEvent;
use crate::member::Member;
use crate::state::MemberState;
use crate::timers::DeadlineSet;

/// Outcome of merging one received record into the membership table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MergeAction {
    /// The endpoint was unknown and has been added.
    Added(MemberEvent),
    /// An existing record was replaced by a later one.
    Updated {
        old_state: MemberState,
        event: MemberEvent,
    },
    /// The record contradicted this node's own record, so the local generation
    /// was bumped past it.
    Refuted(MemberEvent),
    /// Stale record, nothing changed.
    Unchanged,
}

/*
 *
 * ===== Membership =====
 *
 */
/// [`Membership`] is the local view of the cluster: one record per known peer,
/// this node's own record, and the deadlines that drive failure detection.
///
/// Every received record goes through [`Membership::merge`]. Local transitions
/// (suspicion, death, pruning) only ever raise a member's state.
///
/// Locks are never nested, with one exception: the prune sweep holds the prune
/// set while it removes members from the table.
pub(crate) struct Membership {
    local_endpoint: SocketAddrV4,
    local: RwLock<Member>,
    members: Mutex<HashMap<SocketAddrV4, Member>>,

    /// Probed members that have not answered yet, keyed to the instant they are declared dead
    awaiting_acks: DeadlineSet,

    /// Dead or departed members, keyed to the end of their cool-off
    dead: DeadlineSet,

    /// Members no longer gossiped, keyed to the instant they are removed
    prune: DeadlineSet,

    dead_cool_off: Duration,
    prune_timeout: Duration,
}

impl Membership {
    pub(crate) fn new(local: Member, dead_cool_off: Duration, prune_timeout: Duration) -> Self {
        Self {
            local_endpoint: local.endpoint(),
            local: RwLock::new(local),
            members: Mutex::new(HashMap::new()),
            awaiting_acks: DeadlineSet::new(),
            dead: DeadlineSet::new(),
            prune: DeadlineSet::new(),
            dead_cool_off,
            prune_timeout,
        }
    }

    pub(crate) fn local_endpoint(&self) -> SocketAddrV4 {
        self.local_endpoint
    }

    pub(crate) fn local_member(&self) -> Member {
        self.local.read().clone()
    }

    pub(crate) fn set_local_state(&self, state: MemberState) {
        self.local.write().state = state;
    }

    /// Merges a record received from `sender`.
    ///
    /// A record about this node is a claim to refute, never a table entry. An
    /// unknown endpoint is added whatever its state. A known endpoint is only
    /// updated when the record supersedes what we hold.
    pub(crate) fn merge(
        &self,
        sender: SocketAddrV4,
        received_at: SystemTime,
        incoming: &Member,
        now: Instant,
    ) -> MergeAction {
        let endpoint = incoming.endpoint();
        if endpoint == self.local_endpoint {
            return self.refute(sender, received_at, incoming);
        }

        let action = {
            let mut members = self.members.lock();
            match members.get_mut(&endpoint) {
                None => {
                    let mut member = incoming.clone();
                    member.gossip_counter = 0;
                    let event = MemberEvent::new(sender, received_at, &member);
                    members.insert(endpoint, member);
                    MergeAction::Added(event)
                }
                Some(existing) if existing.is_superseded_by(incoming) => {
                    let old_state = existing.state;
                    existing.apply(incoming);
                    MergeAction::Updated {
                        old_state,
                        event: MemberEvent::new(sender, received_at, existing),
                    }
                }
                Some(_) => MergeAction::Unchanged,
            }
        };

        if action != MergeAction::Unchanged {
            self.track_liveness(endpoint, incoming.state, now);
        }
        action
    }

    fn refute(&self, sender: SocketAddrV4, received_at: SystemTime, claim: &Member) -> MergeAction {
        let mut local = self.local.write();
        if local.state == MemberState::Left {
            return MergeAction::Unchanged;
        }

        let contradicts = local.is_later_generation(claim.generation)
            || (claim.generation == local.generation && claim.state != MemberState::Alive);
        if !contradicts {
            return MergeAction::Unchanged;
        }

        local.generation = claim.generation.wrapping_add(1);
        MergeAction::Refuted(MemberEvent::new(sender, received_at, &local))
    }

    // Down members start cooling off; a member that came back is no longer
    // headed for removal.
    fn track_liveness(&self, endpoint: SocketAddrV4, state: MemberState, now: Instant) {
        if state.is_down() {
            self.dead.insert_if_absent(endpoint, now + self.dead_cool_off);
        } else {
            self.dead.remove(&endpoint);
            self.prune.remove(&endpoint);
        }
    }

    /// Raises a member's state after a local observation. Lower or equal states
    /// are ignored, as are unknown endpoints.
    pub(crate) fn update_state(
        &self,
        endpoint: SocketAddrV4,
        state: MemberState,
        now: Instant,
    ) -> Option<MemberEvent> {
        let event = {
            let mut members = self.members.lock();
            let member = members.get_mut(&endpoint)?;
            if member.state >= state {
                return None;
            }
            member.set_state(state);
            MemberEvent::new(self.local_endpoint, SystemTime::now(), member)
        };

        if state.is_down() {
            self.dead.insert_if_absent(endpoint, now + self.dead_cool_off);
        }
        Some(event)
    }

    /// Records to gossip towards `destination`: every member not scheduled for
    /// pruning, least gossiped first, with the destination's own record leading.
    pub(crate) fn snapshot(&self, destination: Option<SocketAddrV4>) -> Vec<Member> {
        let pruning: HashSet<SocketAddrV4> = self.prune.endpoints().into_iter().collect();

        let mut snapshot: Vec<Member> = {
            let members = self.members.lock();
            members
                .values()
                .filter(|member| {
                    let endpoint = member.endpoint();
                    Some(endpoint) == destination || !pruning.contains(&endpoint)
                })
                .cloned()
                .collect()
        };
        snapshot.sort_by_key(Member::gossip_counter);

        if let Some(destination) = destination {
            if let Some(position) = snapshot.iter().position(|member| member.endpoint() == destination) {
                let member = snapshot.remove(position);
                snapshot.insert(0, member);
            }
        }
        snapshot
    }

    /// Counts one more dissemination for each endpoint that went out in a packet.
    pub(crate) fn mark_gossiped(&self, endpoints: &[SocketAddrV4]) {
        let mut members = self.members.lock();
        for endpoint in endpoints {
            if let Some(member) = members.get_mut(endpoint) {
                member.gossip_counter = member.gossip_counter.saturating_add(1);
            }
        }
    }

    /// A random probe target among the members we still gossip about.
    pub(crate) fn random_member(&self) -> Option<Member> {
        self.snapshot(None).choose(&mut thread_rng()).cloned()
    }

    /// Up to `count` distinct active members, none of them in `exclude`.
    pub(crate) fn random_members(&self, count: usize, exclude: &[SocketAddrV4]) -> Vec<Member> {
        let candidates: Vec<Member> = self
            .snapshot(None)
            .into_iter()
            .filter(|member| member.state.is_active() && !exclude.contains(&member.endpoint()))
            .collect();
        candidates
            .choose_multiple(&mut thread_rng(), count)
            .cloned()
            .collect()
    }

    pub(crate) fn members(&self) -> Vec<Member> {
        self.members.lock().values().cloned().collect()
    }

    pub(crate) fn member(&self, endpoint: &SocketAddrV4) -> Option<Member> {
        self.members.lock().get(endpoint).cloned()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    pub(crate) fn await_ack(&self, endpoint: SocketAddrV4, deadline: Instant) -> bool {
        self.awaiting_acks.insert_if_absent(endpoint, deadline)
    }

    pub(crate) fn ack_received(&self, endpoint: &SocketAddrV4) -> bool {
        self.awaiting_acks.remove(endpoint)
    }

    pub(crate) fn is_awaiting_ack(&self, endpoint: &SocketAddrV4) -> bool {
        self.awaiting_acks.contains(endpoint)
    }

    /// Runs one pass over all deadlines and returns the events of the local
    /// transitions it made.
    pub(crate) fn sweep(&self, now: Instant) -> Vec<MemberEvent> {
        let mut events = self.expire_awaiting_acks(now);
        self.expire_dead(now);
        events.extend(self.expire_prune(now));
        events
    }

    /// Members that never answered a probe in time are declared dead.
    pub(crate) fn expire_awaiting_acks(&self, now: Instant) -> Vec<MemberEvent> {
        let mut events = Vec::new();
        for endpoint in self.awaiting_acks.drain_expired(now) {
            match self.update_state(endpoint, MemberState::Dead, now) {
                Some(event) => events.push(event),
                None => {
                    if self.member(&endpoint).map_or(false, |member| member.state.is_down()) {
                        self.dead.insert_if_absent(endpoint, now + self.dead_cool_off);
                    }
                }
            }
        }
        events
    }

    /// Members that stayed down through their cool-off stop being gossiped and
    /// are scheduled for removal.
    pub(crate) fn expire_dead(&self, now: Instant) {
        for endpoint in self.dead.drain_expired(now) {
            if self.member(&endpoint).map_or(false, |member| member.state.is_down()) {
                self.prune.insert_if_absent(endpoint, now + self.prune_timeout);
            }
        }
    }

    /// Removes members whose prune deadline passed while they were still down.
    pub(crate) fn expire_prune(&self, now: Instant) -> Vec<MemberEvent> {
        let received_at = SystemTime::now();
        let mut events = Vec::new();
        self.prune.drain_expired_with(now, |endpoint| {
            let mut members = self.members.lock();
            if let Entry::Occupied(entry) = members.entry(endpoint) {
                if entry.get().state.is_down() {
                    let member = entry.remove();
                    events.push(
                        MemberEvent::new(self.local_endpoint, received_at, &member)
                            .with_state(MemberState::Pruned),
                    );
                }
            }
        });
        events
    }
}
