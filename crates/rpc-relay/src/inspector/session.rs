//! Panel-side session: attaches to the relay for one tab and feeds the
//! capture buffer.

use std::future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::buffer::{CaptureBuffer, Insertion};
use super::search::SearchEngine;
use super::view::{self, ViewModel, RESTART_TEXT, TAB_UNRESOLVED_TEXT};
use crate::capture::CaptureEvent;
use crate::client::{HostProbe, PidFileProbe, RelayConnection};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::protocol::{ActionMessage, Message, Role, TabId};
use crate::resilient::{LinkState, NextStep, ReconnectPolicy, ResilientLink};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Attached,
    /// Closed by the user or superseded by another inspector.
    Inactive,
    Unavailable,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Attached => "attached",
            SessionState::Inactive => "inactive",
            SessionState::Unavailable => "unavailable",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionFault {
    TabUnresolved,
    HostUnavailable,
}

/// Process-wide capture flag, shared by every session in the process.
#[derive(Clone, Debug)]
pub struct CaptureSwitch(Arc<AtomicBool>);

impl CaptureSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

impl Default for CaptureSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

/// User actions on the panel.
#[derive(Clone, Debug, PartialEq)]
pub enum PanelInput {
    Visibility(bool),
    Query(String),
    Select(u64),
    Next,
    Prev,
    SetCapture(bool),
    Clear,
    Close,
}

pub struct InspectorSession {
    tab: Option<TabId>,
    socket_path: PathBuf,
    link: ResilientLink,
    conn: Option<RelayConnection>,
    probe: Box<dyn HostProbe>,
    state: SessionState,
    fault: Option<SessionFault>,
    capture: CaptureSwitch,
    buffer: CaptureBuffer,
    search: SearchEngine,
}

impl InspectorSession {
    /// `tab` is whatever the host could tell us about the inspected tab.
    pub fn new(tab: Option<TabId>, config: &RelayConfig, capture: CaptureSwitch) -> Self {
        Self {
            tab,
            socket_path: config.socket_path.clone(),
            link: ResilientLink::new(ReconnectPolicy::OnVisibility),
            conn: None,
            probe: Box::new(PidFileProbe::new(&config.meta_path)),
            state: SessionState::Disconnected,
            fault: None,
            capture,
            buffer: CaptureBuffer::new(config.buffer_capacity),
            search: SearchEngine::new(),
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn HostProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn tab(&self) -> Option<TabId> {
        self.tab
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn fault(&self) -> Option<SessionFault> {
        self.fault
    }

    pub fn capture(&self) -> &CaptureSwitch {
        &self.capture
    }

    pub fn buffer(&self) -> &CaptureBuffer {
        &self.buffer
    }

    pub fn search(&self) -> &SearchEngine {
        &self.search
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Resolve the tab, connect and declare it.
    pub async fn connect(&mut self) -> Result<(), RelayError> {
        match self.state {
            SessionState::Unavailable => return Err(RelayError::HostUnavailable),
            SessionState::Attached => return Ok(()),
            _ => {}
        }
        let Some(tab) = self.tab else {
            self.state = SessionState::Disconnected;
            self.fault = Some(SessionFault::TabUnresolved);
            warn!("cannot determine inspected tab");
            return Err(RelayError::TabUnresolved);
        };
        if !self.probe.is_alive() {
            self.host_gone();
            return Err(RelayError::HostUnavailable);
        }

        self.state = SessionState::Connecting;
        self.link.begin_connect();
        let result = async {
            let mut conn =
                RelayConnection::connect(&self.socket_path, Message::hello(Role::Inspector, None))
                    .await?;
            conn.send(&Message::init(tab)).await?;
            Ok::<_, RelayError>(conn)
        }
        .await;

        match result {
            Ok(conn) => {
                self.conn = Some(conn);
                self.link.connected();
                self.state = SessionState::Attached;
                self.fault = None;
                info!(tab_id = %tab, "inspector attached");
                Ok(())
            }
            Err(err) => {
                debug!(tab_id = %tab, error = %err, "inspector connect failed");
                self.state = SessionState::Disconnected;
                self.link.disconnected();
                Err(err)
            }
        }
    }

    /// The channel dropped underneath us.
    pub fn on_disconnected(&mut self) -> NextStep {
        self.conn = None;
        match self.state {
            SessionState::Inactive | SessionState::Unavailable => NextStep::Nothing,
            _ => {
                self.state = SessionState::Disconnected;
                self.link.disconnected()
            }
        }
    }

    /// One reconnection attempt per visibility regain. Retries an
    /// unresolved tab too.
    pub async fn visibility_changed(&mut self, visible: bool) -> Result<(), RelayError> {
        if matches!(self.state, SessionState::Inactive | SessionState::Unavailable) {
            return Ok(());
        }
        match self.link.visibility_changed(visible) {
            NextStep::ConnectNow => self.connect().await,
            _ => Ok(()),
        }
    }

    /// The user closed the panel: tell the relay first, then let go.
    pub async fn close(&mut self) -> Result<(), RelayError> {
        let result = match (self.state, self.tab) {
            (SessionState::Attached, Some(tab)) => self.send(&Message::panel_closed(tab)).await,
            _ => Ok(()),
        };
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        if self.state != SessionState::Unavailable {
            self.state = SessionState::Inactive;
        }
        result
    }

    /// Probe the host before every send. A failed send is a transient
    /// disconnect.
    async fn send(&mut self, message: &Message) -> Result<(), RelayError> {
        if !self.probe.is_alive() {
            self.host_gone();
            return Err(RelayError::HostUnavailable);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(RelayError::ChannelClosed);
        };
        if let Err(err) = conn.send(message).await {
            self.on_disconnected();
            return Err(err);
        }
        Ok(())
    }

    fn host_gone(&mut self) {
        warn!("relay host gone, inspector unavailable");
        self.conn = None;
        self.link.invalidate();
        self.state = SessionState::Unavailable;
        self.fault = Some(SessionFault::HostUnavailable);
        self.buffer.clear();
        self.search.reset();
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Buffer a forwarded event. Returns the insertion, or `None` when the
    /// session is not attached or capture is off.
    pub fn on_capture_event(&mut self, event: CaptureEvent) -> Option<Insertion> {
        if self.state != SessionState::Attached || !self.capture.is_enabled() {
            return None;
        }
        let insertion = self.buffer.push(event);
        self.search.inserted(&insertion, &self.buffer);
        if self.buffer.selected().is_none() {
            self.search.select_quietly(insertion.id, &mut self.buffer);
        }
        Some(insertion)
    }

    /// Messages from the relay and panel-local actions.
    pub fn handle_message(&mut self, message: Message) {
        match message {
            Message::Action(ActionMessage::CaptureEvent { data, .. }) => {
                self.on_capture_event(data);
            }
            Message::Action(ActionMessage::PanelSuperseded { tab_id }) if Some(tab_id) == self.tab => {
                info!(tab_id = %tab_id, "inspector superseded by another panel");
                self.conn = None;
                self.state = SessionState::Inactive;
            }
            Message::Action(ActionMessage::SetCapture { enabled }) => self.capture.set(enabled),
            Message::Action(ActionMessage::ClearRequests) => {
                self.buffer.clear();
                self.search.reset();
            }
            other => debug!(message = ?other, "ignoring inspector message"),
        }
    }

    /// Apply a panel input. Returns `false` once the session is finished.
    pub async fn apply(&mut self, input: PanelInput) -> bool {
        match input {
            PanelInput::Visibility(visible) => {
                if let Err(err) = self.visibility_changed(visible).await {
                    if err.is_transient() {
                        debug!(error = %err, "reconnect on visibility failed");
                    } else {
                        warn!(error = %err, state = self.state.as_str(), "inspector cannot reconnect");
                    }
                }
            }
            PanelInput::Query(query) => self.search.set_query(&query, &mut self.buffer),
            PanelInput::Select(id) => {
                self.search.select_by_user(id, &mut self.buffer);
            }
            PanelInput::Next => {
                self.search.next(&mut self.buffer);
            }
            PanelInput::Prev => {
                self.search.prev(&mut self.buffer);
            }
            PanelInput::SetCapture(enabled) => {
                self.handle_message(Message::Action(ActionMessage::SetCapture { enabled }))
            }
            PanelInput::Clear => self.handle_message(Message::Action(ActionMessage::ClearRequests)),
            PanelInput::Close => {
                if let Err(err) = self.close().await {
                    debug!(error = %err, "close notification not delivered");
                }
                return false;
            }
        }
        true
    }

    pub async fn recv(&mut self) -> Option<Message> {
        match self.conn.as_mut() {
            Some(conn) => conn.recv().await,
            None => None,
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn view(&self) -> ViewModel {
        let notice = match self.fault {
            Some(SessionFault::HostUnavailable) => Some(RESTART_TEXT),
            Some(SessionFault::TabUnresolved) => Some(TAB_UNRESOLVED_TEXT),
            None => None,
        };
        view::project(
            &self.buffer,
            &self.search,
            self.state,
            self.capture.is_enabled(),
            notice,
        )
    }

    /// Run until the panel is closed or its input goes away, calling
    /// `render` after every change.
    pub async fn run<F>(mut self, mut inputs: mpsc::Receiver<PanelInput>, mut render: F) -> Self
    where
        F: FnMut(&ViewModel),
    {
        if let Err(err) = self.connect().await {
            debug!(error = %err, "initial connect failed");
        }
        render(&self.view());

        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => {
                        if !self.apply(input).await {
                            render(&self.view());
                            break;
                        }
                    }
                    None => {
                        let _ = self.close().await;
                        break;
                    }
                },
                inbound = next_inbound(&mut self.conn) => match inbound {
                    Some(message) => self.handle_message(message),
                    None => {
                        self.on_disconnected();
                    }
                },
            }
            render(&self.view());
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
