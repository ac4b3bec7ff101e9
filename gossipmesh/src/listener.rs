use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use tracing::warn;

use crate::event::MemberEvent;

/// [`MemberListener`] is notified once per accepted change to a single member.
///
/// This covers members joining, records superseded by gossip, and transitions
/// this node makes itself: suspicion after a failed probe, death once the ACK
/// deadline passes, and the final removal (reported with state `Pruned`).
#[async_trait]
pub trait MemberListener: Send + Sync {
    async fn on_member_updated(&self, event: MemberEvent) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// [`MemberEventsListener`] receives every event derived from one inbound
/// datagram in a single call.
///
/// The batch holds one observation per record the datagram carried, including
/// records that changed nothing, plus a synthesized event about this node when it
/// had to refute a claim. Local transitions are delivered as batches too.
#[async_trait]
pub trait MemberEventsListener: Send + Sync {
    async fn on_member_events(&self, events: Vec<MemberEvent>) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Fans events out to the registered listeners. Each call runs on its own task,
/// so a slow or failing listener never holds up the protocol.
#[derive(Clone, Default)]
pub(crate) struct Listeners {
    member: Vec<Arc<dyn MemberListener>>,
    events: Vec<Arc<dyn MemberEventsListener>>,
}

impl Listeners {
    pub(crate) fn new(member: Vec<Arc<dyn MemberListener>>, events: Vec<Arc<dyn MemberEventsListener>>) -> Self {
        Self { member, events }
    }

    pub(crate) fn notify_member_updated(&self, event: MemberEvent) {
        for listener in &self.member {
            let listener = listener.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.on_member_updated(event).await {
                    warn!("Member listener failed: {}", e);
                }
            });
        }
    }

    pub(crate) fn notify_member_events(&self, events: Vec<MemberEvent>) {
        if events.is_empty() {
            return;
        }
        for listener in &self.events {
            let listener = listener.clone();
            let events = events.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.on_member_events(events).await {
                    warn!("Member events listener failed: {}", e);
                }
            });
        }
    }

    /// Local transitions reach both channels.
    pub(crate) fn notify_local(&self, events: Vec<MemberEvent>) {
        for event in &events {
            self.notify_member_updated(event.clone());
        }
        self.notify_member_events(events);
    }
}
