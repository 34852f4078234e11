//! Pure projection of inspector state into something a UI can draw.

use std::fmt::Write as _;

use super::buffer::{CaptureBuffer, CaptureEntry};
use super::search::{entry_matches, Match, SearchEngine};
use super::session::SessionState;

pub const NO_DATA_TEXT: &str = "(no data)";
pub const NO_ERROR_TEXT: &str = "(no error)";
pub const NO_MATCHES_TEXT: &str = "No matches";
pub const NO_CALLS_TEXT: &str = "No RPC calls";
pub const RESTART_TEXT: &str = "Relay host is gone. Restart the inspector.";
pub const TAB_UNRESOLVED_TEXT: &str = "Cannot determine inspected tab.";

#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub id: u64,
    pub method: String,
    pub service: String,
    pub method_type: &'static str,
    pub selected: bool,
    pub failed: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detail {
    pub id: u64,
    pub method: String,
    pub method_type: &'static str,
    pub request: String,
    pub response: String,
    pub error: String,
    /// Whether the entry passes the current query.
    pub in_filter: bool,
    pub matches: Vec<Match>,
    pub current: Option<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ViewModel {
    pub state: SessionState,
    pub rows: Vec<Row>,
    pub empty_message: Option<&'static str>,
    pub detail: Option<Detail>,
    pub count_label: String,
    pub navigation_enabled: bool,
    /// Transient states dim the controls instead of raising errors.
    pub controls_enabled: bool,
    pub capture_enabled: bool,
    pub notice: Option<&'static str>,
}

fn row(entry: &CaptureEntry, selected: Option<u64>) -> Row {
    let (service, method) = entry.event.method_parts();
    Row {
        id: entry.id,
        method: method.to_string(),
        service: service.to_string(),
        method_type: entry.event.method_type.as_str(),
        selected: selected == Some(entry.id),
        failed: entry.event.error.is_some(),
    }
}

fn detail(entry: &CaptureEntry, search: &SearchEngine) -> Detail {
    let or = |text: &Option<String>, placeholder: &str| {
        text.clone().unwrap_or_else(|| placeholder.to_string())
    };
    Detail {
        id: entry.id,
        method: entry.event.method.clone(),
        method_type: entry.event.method_type.as_str(),
        request: or(&entry.text.request, NO_DATA_TEXT),
        response: or(&entry.text.response, NO_DATA_TEXT),
        error: or(&entry.text.error, NO_ERROR_TEXT),
        in_filter: entry_matches(entry, search.query().trim()),
        matches: search.matches().to_vec(),
        current: search.current_match().map(|_| search.current_index()),
    }
}

pub fn project(
    buffer: &CaptureBuffer,
    search: &SearchEngine,
    state: SessionState,
    capture_enabled: bool,
    notice: Option<&'static str>,
) -> ViewModel {
    let selected = buffer.selected();
    let rows: Vec<Row> = search
        .filtered(buffer)
        .into_iter()
        .map(|e| row(e, selected))
        .collect();
    let empty_message = match (rows.is_empty(), search.is_active()) {
        (false, _) => None,
        (true, true) => Some(NO_MATCHES_TEXT),
        (true, false) => Some(NO_CALLS_TEXT),
    };
    let controls_enabled = state == SessionState::Attached;

    ViewModel {
        state,
        rows,
        empty_message,
        detail: buffer.selected_entry().map(|e| detail(e, search)),
        count_label: search.count_label(),
        navigation_enabled: controls_enabled && search.can_navigate(buffer),
        controls_enabled,
        capture_enabled,
        notice,
    }
}

impl ViewModel {
    /// Plain-text rendering for terminals.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let capture = if self.capture_enabled { "on" } else { "off" };
        let _ = writeln!(out, "[{}] capture {} | {}", self.state.as_str(), capture, self.count_label);
        if let Some(notice) = self.notice {
            let _ = writeln!(out, "! {notice}");
        }
        if let Some(message) = self.empty_message {
            let _ = writeln!(out, "  {message}");
        }
        for row in &self.rows {
            let marker = if row.selected { '>' } else { ' ' };
            let flag = if row.failed { " !" } else { "" };
            let _ = writeln!(
                out,
                "{marker} #{:<4} {} ({}) {}{flag}",
                row.id, row.method, row.method_type, row.service
            );
        }
        if let Some(detail) = &self.detail {
            let pinned = if detail.in_filter { "" } else { " [not in filter]" };
            let _ = writeln!(out, "── #{} {} ({}){pinned}", detail.id, detail.method, detail.method_type);
            let _ = writeln!(out, "request:\n{}", detail.request);
            let _ = writeln!(out, "response:\n{}", detail.response);
            let _ = writeln!(out, "error:\n{}", detail.error);
        }
        out
    }
}
