//! Page-side observer endpoint.
//!
//! Receives shim messages posted on the page, snapshots them into
//! [`CaptureEvent`]s and forwards them to the relay over a channel that
//! reconnects on its own (bounded, visibility-gated).

use std::future;
use std::path::PathBuf;
use std::pin::Pin;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{self, Sleep};
use tracing::{debug, info, warn};

use crate::capture::{CaptureEvent, MethodType, RpcStatus};
use crate::client::{HostProbe, PidFileProbe, RelayConnection};
use crate::config::RelayConfig;
use crate::live::{self, LiveValue};
use crate::protocol::{ActionMessage, Message, Role, TabId, SHIM_MESSAGE_TYPE};
use crate::resilient::{LinkState, NextStep, ReconnectPolicy, ResilientLink};

// ── Page boundary ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Posted by the page to itself.
    SamePage,
    /// From a frame, another window or an extension.
    Foreign,
}

#[derive(Clone, Debug)]
pub struct PageMessage {
    pub origin: MessageOrigin,
    pub data: LiveValue,
}

impl PageMessage {
    pub fn same_page(data: impl Into<LiveValue>) -> Self {
        Self {
            origin: MessageOrigin::SamePage,
            data: data.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageLifecycle {
    Visible,
    Hidden,
    RestoredFromCache,
}

#[derive(Clone, Debug)]
pub enum PageSignal {
    Message(PageMessage),
    Lifecycle(PageLifecycle),
}

/// Turn a shim message into a capture event, or `None` if it is not one.
///
/// Payloads are snapshotted here so nothing live crosses the channel.
pub fn accept_page_message(message: &PageMessage) -> Option<CaptureEvent> {
    if message.origin != MessageOrigin::SamePage {
        return None;
    }
    let data = &message.data;
    if data.get("type")?.as_str()?.as_str() != SHIM_MESSAGE_TYPE {
        return None;
    }

    let method = data.get("method").and_then(|m| m.as_str()).unwrap_or_default();
    let method_type = data
        .get("methodType")
        .and_then(|t| t.as_str())
        .map(|t| MethodType::parse(&t))
        .unwrap_or(MethodType::Other);
    let field = |key: &str| data.get(key).as_ref().and_then(live::snapshot);
    let error = match field("error") {
        None | Some(Value::Null) => None,
        Some(payload) => Some(RpcStatus::from_payload(&payload)),
    };

    Some(CaptureEvent {
        method,
        method_type,
        request: field("request"),
        response: field("response"),
        error,
    })
}

// ── Endpoint ────────────────────────────────────────────────────────

pub struct ObserverEndpoint {
    tab: TabId,
    socket_path: PathBuf,
    link: ResilientLink,
    conn: Option<RelayConnection>,
    probe: Box<dyn HostProbe>,
    forwarded: u64,
    skipped: u64,
}

impl ObserverEndpoint {
    pub fn new(tab: TabId, config: &RelayConfig) -> Self {
        Self {
            tab,
            socket_path: config.socket_path.clone(),
            link: ResilientLink::new(ReconnectPolicy::Bounded {
                max_attempts: config.retry_attempts,
                delay: config.retry_delay,
            }),
            conn: None,
            probe: Box::new(PidFileProbe::new(&config.meta_path)),
            forwarded: 0,
            skipped: 0,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn HostProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn tab(&self) -> TabId {
        self.tab
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Events sent to the relay.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Accepted events that could not be sent because no channel was up.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub async fn connect(&mut self) -> NextStep {
        if self.link.state() == LinkState::Unavailable {
            return NextStep::GiveUp;
        }
        if !self.probe.is_alive() {
            return self.host_gone();
        }
        self.link.begin_connect();
        let hello = Message::hello(Role::Observer, Some(self.tab));
        match RelayConnection::connect(&self.socket_path, hello).await {
            Ok(conn) => {
                self.conn = Some(conn);
                self.link.connected();
                debug!(tab_id = %self.tab, "observer connected");
                NextStep::Nothing
            }
            Err(err) => {
                debug!(tab_id = %self.tab, error = %err, "observer connect failed");
                self.link.disconnected()
            }
        }
    }

    pub async fn forward(&mut self, event: CaptureEvent) -> NextStep {
        if self.conn.is_none() {
            self.skipped += 1;
            return NextStep::Nothing;
        }
        if !self.probe.is_alive() {
            return self.host_gone();
        }
        let message = Message::capture(event);
        let sent = match self.conn.as_mut() {
            Some(conn) => conn.send(&message).await,
            None => return NextStep::Nothing,
        };
        match sent {
            Ok(()) => {
                self.forwarded += 1;
                NextStep::Nothing
            }
            Err(err) => {
                debug!(tab_id = %self.tab, error = %err, "forward failed");
                self.skipped += 1;
                self.on_disconnected()
            }
        }
    }

    pub async fn page_message(&mut self, message: PageMessage) -> NextStep {
        match accept_page_message(&message) {
            Some(event) => self.forward(event).await,
            None => NextStep::Nothing,
        }
    }

    /// The relay tells an observer only one thing: its inspector is gone.
    /// Register again straight away so the next attach finds us.
    pub fn handle_relay_message(&mut self, message: Message) -> NextStep {
        match message {
            Message::Action(ActionMessage::PanelClosed { tab_id }) if tab_id == self.tab => {
                info!(tab_id = %self.tab, "inspector gone, re-registering");
                self.conn = None;
                self.link.restart()
            }
            other => {
                debug!(tab_id = %self.tab, message = ?other, "ignoring relay message");
                NextStep::Nothing
            }
        }
    }

    pub fn on_disconnected(&mut self) -> NextStep {
        self.conn = None;
        self.link.disconnected()
    }

    pub fn lifecycle(&mut self, event: PageLifecycle) -> NextStep {
        match event {
            PageLifecycle::Visible => self.link.visibility_changed(true),
            PageLifecycle::Hidden => self.link.visibility_changed(false),
            PageLifecycle::RestoredFromCache => {
                self.conn = None;
                self.link.restored_from_cache()
            }
        }
    }

    fn host_gone(&mut self) -> NextStep {
        warn!(tab_id = %self.tab, "relay host gone, observer stopping");
        self.conn = None;
        self.link.invalidate();
        NextStep::GiveUp
    }

    /// Drive the endpoint from page signals until the page goes away (the
    /// sender is dropped) or the host does.
    pub async fn run(mut self, mut signals: mpsc::Receiver<PageSignal>) -> Self {
        let mut retry: Option<Pin<Box<Sleep>>> = None;
        let mut step = NextStep::ConnectNow;

        loop {
            match step {
                NextStep::ConnectNow => {
                    retry = None;
                    step = self.connect().await;
                    continue;
                }
                NextStep::RetryAfter(delay) => retry = Some(Box::pin(time::sleep(delay))),
                NextStep::GiveUp if self.link.state() == LinkState::Unavailable => break,
                NextStep::GiveUp | NextStep::AwaitVisibility => retry = None,
                NextStep::Nothing => {}
            }

            step = tokio::select! {
                signal = signals.recv() => match signal {
                    Some(PageSignal::Message(message)) => self.page_message(message).await,
                    Some(PageSignal::Lifecycle(event)) => self.lifecycle(event),
                    None => break,
                },
                inbound = next_inbound(&mut self.conn) => match inbound {
                    Some(message) => self.handle_relay_message(message),
                    None => self.on_disconnected(),
                },
                _ = retry_elapsed(&mut retry) => {
                    if self.link.is_visible() {
                        NextStep::ConnectNow
                    } else {
                        NextStep::AwaitVisibility
                    }
                }
            };
        }

        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        self
    }
}

async fn next_inbound(conn: &mut Option<RelayConnection>) -> Option<Message> {
    match conn {
        Some(conn) => conn.recv().await,
        None => future::pending().await,
    }
}

async fn retry_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}
