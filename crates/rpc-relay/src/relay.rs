//! Tab-scoped session router.
//!
//! [`Relay`] is plain state: every operation runs to completion and is
//! applied from exactly one task (see [`run`]), so arrival order is the only
//! ordering there is. Channels are [`Port`]s, the sending half of a
//! connection's outbound queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::capture::CaptureEvent;
use crate::error::RelayError;
use crate::protocol::{Message, TabId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One end of a long-lived channel, as seen by the relay.
#[derive(Clone, Debug)]
pub struct Port {
    id: ChannelId,
    tx: mpsc::UnboundedSender<Message>,
}

impl Port {
    pub fn new(id: ChannelId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn post(&self, message: Message) -> Result<(), RelayError> {
        self.tx.send(message).map_err(|_| RelayError::ChannelClosed)
    }
}

struct SessionRecord {
    inspector: Option<Port>,
    active: bool,
    observers: Vec<Port>,
    last_active: Option<u64>,
}

impl SessionRecord {
    fn empty() -> Self {
        Self {
            inspector: None,
            active: false,
            observers: Vec::new(),
            last_active: None,
        }
    }

    fn is_live(&self) -> bool {
        self.inspector.is_some() || !self.observers.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabStatus {
    pub tab_id: TabId,
    pub attached: bool,
    pub active: bool,
    pub observers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub sessions: Vec<TabStatus>,
    pub routed: u64,
    pub dropped: u64,
}

#[derive(Default)]
pub struct Relay {
    sessions: HashMap<TabId, SessionRecord>,
    routed: u64,
    dropped: u64,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link an inspector channel to `tab`. A channel already attached to the
    /// tab is told it was superseded and then unlinked; it is returned so the
    /// caller can see what was replaced. A channel moving to a new tab leaves
    /// its previous tab first, which is torn down as if the channel closed.
    pub fn attach(&mut self, tab: TabId, port: Port) -> Option<Port> {
        let new_id = port.id();
        for stale in self.tabs_owned_by(new_id) {
            if stale != tab {
                debug!(tab_id = %stale, channel = %new_id, "inspector moved to another tab");
                self.teardown(stale);
            }
        }

        let record = self.sessions.entry(tab).or_insert_with(SessionRecord::empty);
        let previous = record.inspector.take();
        if let Some(old) = &previous {
            if old.id() != new_id {
                if let Err(err) = old.post(Message::panel_superseded(tab)) {
                    debug!(tab_id = %tab, channel = %old.id(), error = %err, "superseded inspector already gone");
                }
                info!(tab_id = %tab, old = %old.id(), new = %port.id(), "inspector superseded");
            }
        }
        info!(tab_id = %tab, channel = %new_id, "inspector attached");
        record.inspector = Some(port);
        record.active = true;
        record.last_active = Some(now_millis());
        previous.filter(|old| old.id() != new_id)
    }

    /// The inspector on `channel` is going away on purpose; stop forwarding
    /// to it but keep the record until its channel actually closes. Ignored
    /// unless `channel` is the one attached to `tab`.
    pub fn detach_explicit(&mut self, tab: TabId, channel: ChannelId) {
        let Some(record) = self.sessions.get_mut(&tab) else {
            return;
        };
        if record.inspector.as_ref().map(Port::id) != Some(channel) {
            debug!(tab_id = %tab, channel = %channel, "detach from a channel that does not own the tab");
            return;
        }
        if record.active {
            debug!(tab_id = %tab, "inspector explicitly closed");
        }
        record.active = false;
    }

    /// An inspector channel closed. Only the channel currently attached to a
    /// tab owns that tab; a superseded channel closing is a no-op.
    pub fn channel_closed(&mut self, channel: ChannelId) {
        let owned = self.tabs_owned_by(channel);
        if owned.is_empty() {
            debug!(channel = %channel, "closed channel owns no session");
        }
        for tab in owned {
            debug!(tab_id = %tab, channel = %channel, "inspector disconnected");
            self.teardown(tab);
        }
    }

    fn tabs_owned_by(&self, channel: ChannelId) -> Vec<TabId> {
        self.sessions
            .iter()
            .filter(|(_, record)| record.inspector.as_ref().map(Port::id) == Some(channel))
            .map(|(tab, _)| *tab)
            .collect()
    }

    pub fn register_observer(&mut self, tab: TabId, port: Port) {
        let record = self.sessions.entry(tab).or_insert_with(SessionRecord::empty);
        if record.observers.iter().any(|p| p.id() == port.id()) {
            return;
        }
        debug!(tab_id = %tab, channel = %port.id(), "observer registered");
        record.observers.push(port);
    }

    pub fn observer_closed(&mut self, tab: TabId, channel: ChannelId) {
        let Some(record) = self.sessions.get_mut(&tab) else {
            return;
        };
        record.observers.retain(|p| p.id() != channel);
        if record.inspector.is_some() {
            debug!(tab_id = %tab, channel = %channel, "observer disconnected, inspector still attached");
        }
        if !record.is_live() {
            self.sessions.remove(&tab);
        }
    }

    /// Forward an event to the tab's inspector. Returns whether it was
    /// delivered to a channel; nothing is buffered here.
    pub fn route(&mut self, tab: TabId, event: CaptureEvent) -> bool {
        let target = self
            .sessions
            .get(&tab)
            .filter(|record| record.active)
            .and_then(|record| record.inspector.as_ref());

        let delivered = match target {
            Some(port) => match port.post(Message::capture(event)) {
                Ok(()) => true,
                Err(err) => {
                    debug!(tab_id = %tab, channel = %port.id(), error = %err, "inspector channel gone while routing");
                    false
                }
            },
            None => false,
        };

        if delivered {
            self.routed += 1;
        } else {
            self.dropped += 1;
        }
        delivered
    }

    pub fn tab_closed(&mut self, tab: TabId) {
        debug!(tab_id = %tab, "tab closed");
        self.teardown(tab);
    }

    fn teardown(&mut self, tab: TabId) {
        let Some(record) = self.sessions.remove(&tab) else {
            return;
        };
        for port in &record.observers {
            if let Err(err) = port.post(Message::panel_closed(tab)) {
                debug!(tab_id = %tab, channel = %port.id(), error = %err, "could not notify observer");
            }
        }
        info!(tab_id = %tab, observers = record.observers.len(), "session torn down");
    }

    pub fn contains(&self, tab: TabId) -> bool {
        self.sessions.contains_key(&tab)
    }

    pub fn is_attached(&self, tab: TabId) -> bool {
        self.sessions
            .get(&tab)
            .is_some_and(|r| r.inspector.is_some() && r.active)
    }

    pub fn observer_count(&self, tab: TabId) -> usize {
        self.sessions.get(&tab).map_or(0, |r| r.observers.len())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn status(&self) -> RelayStatus {
        let mut sessions: Vec<TabStatus> = self
            .sessions
            .iter()
            .map(|(tab, record)| TabStatus {
                tab_id: *tab,
                attached: record.inspector.is_some(),
                active: record.active,
                observers: record.observers.len(),
                last_active: record.last_active,
            })
            .collect();
        sessions.sort_by_key(|s| s.tab_id);
        RelayStatus {
            sessions,
            routed: self.routed,
            dropped: self.dropped,
        }
    }

    pub fn apply(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Attach { tab, port } => {
                self.attach(tab, port);
            }
            RelayCommand::DetachExplicit { tab, channel } => self.detach_explicit(tab, channel),
            RelayCommand::ChannelClosed { channel } => self.channel_closed(channel),
            RelayCommand::RegisterObserver { tab, port } => self.register_observer(tab, port),
            RelayCommand::ObserverClosed { tab, channel } => self.observer_closed(tab, channel),
            RelayCommand::Route { tab, event } => {
                self.route(tab, event);
            }
            RelayCommand::TabClosed { tab } => self.tab_closed(tab),
            RelayCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }
}

// ── Single-task driver ──────────────────────────────────────────────

#[derive(Debug)]
pub enum RelayCommand {
    Attach { tab: TabId, port: Port },
    DetachExplicit { tab: TabId, channel: ChannelId },
    ChannelClosed { channel: ChannelId },
    RegisterObserver { tab: TabId, port: Port },
    ObserverClosed { tab: TabId, channel: ChannelId },
    Route { tab: TabId, event: CaptureEvent },
    TabClosed { tab: TabId },
    Status { reply: oneshot::Sender<RelayStatus> },
}

/// Cloneable handle used by connection tasks to reach the relay task.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayCommand>,
    next_channel: Arc<AtomicU64>,
}

impl RelayHandle {
    /// Start the relay task.
    pub fn spawn() -> (Self, tokio::task::JoinHandle<Relay>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(Relay::new(), rx));
        (
            Self {
                tx,
                next_channel: Arc::new(AtomicU64::new(1)),
            },
            task,
        )
    }

    /// Allocate a fresh channel: the relay-side port and the queue the
    /// connection writer drains.
    pub fn open_port(&self) -> (Port, mpsc::UnboundedReceiver<Message>) {
        let id = ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        (Port::new(id, tx), rx)
    }

    pub fn send(&self, command: RelayCommand) -> Result<(), RelayError> {
        self.tx.send(command).map_err(|_| RelayError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<RelayStatus, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayCommand::Status { reply })?;
        rx.await.map_err(|_| RelayError::ChannelClosed)
    }
}

/// Apply commands in arrival order until every handle is dropped.
pub async fn run(mut relay: Relay, mut rx: mpsc::UnboundedReceiver<RelayCommand>) -> Relay {
    while let Some(command) = rx.recv().await {
        relay.apply(command);
    }
    relay
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
