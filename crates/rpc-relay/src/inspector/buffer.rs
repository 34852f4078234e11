//! Bounded capture storage with a single selection.

use std::collections::VecDeque;

use crate::capture::CaptureEvent;
use crate::relay::now_millis;
use crate::stringify::{safe_stringify, stringify_status};

/// Rendered payload text, computed once at insertion. `None` marks an absent
/// payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntryText {
    pub request: Option<String>,
    pub response: Option<String>,
    pub error: Option<String>,
}

impl EntryText {
    fn render(event: &CaptureEvent) -> Self {
        Self {
            request: event.request.as_ref().map(|v| safe_stringify(Some(v))),
            response: event.response.as_ref().map(|v| safe_stringify(Some(v))),
            error: event.error.as_ref().map(|s| stringify_status(Some(s))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureEntry {
    pub id: u64,
    pub event: CaptureEvent,
    pub inserted_at: u64,
    pub text: EntryText,
}

/// What a single [`CaptureBuffer::push`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Insertion {
    pub id: u64,
    pub evicted: Option<u64>,
    pub selection_cleared: bool,
}

pub struct CaptureBuffer {
    entries: VecDeque<CaptureEntry>,
    capacity: usize,
    next_id: u64,
    selected: Option<u64>,
}

impl CaptureBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
            selected: None,
        }
    }

    /// Append an event, evicting the oldest entry when full.
    pub fn push(&mut self, event: CaptureEvent) -> Insertion {
        let id = self.next_id;
        self.next_id += 1;

        let mut evicted = None;
        let mut selection_cleared = false;
        if self.entries.len() >= self.capacity {
            if let Some(old) = self.entries.pop_front() {
                if self.selected == Some(old.id) {
                    self.selected = None;
                    selection_cleared = true;
                }
                evicted = Some(old.id);
            }
        }

        let text = EntryText::render(&event);
        self.entries.push_back(CaptureEntry {
            id,
            event,
            inserted_at: now_millis(),
            text,
        });
        Insertion {
            id,
            evicted,
            selection_cleared,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &CaptureEntry> {
        self.entries.iter()
    }

    pub fn get(&self, id: u64) -> Option<&CaptureEntry> {
        // ids are contiguous within the buffer
        let first = self.entries.front()?.id;
        let index = id.checked_sub(first)? as usize;
        self.entries.get(index).filter(|e| e.id == id)
    }

    pub fn selected(&self) -> Option<u64> {
        self.selected
    }

    pub fn selected_entry(&self) -> Option<&CaptureEntry> {
        self.selected.and_then(|id| self.get(id))
    }

    /// Select `id` if it is still buffered.
    pub fn select(&mut self, id: u64) -> bool {
        if self.get(id).is_some() {
            self.selected = Some(id);
            true
        } else {
            false
        }
    }

    pub fn deselect(&mut self) {
        self.selected = None;
    }

    /// Clicking the selected row deselects it; any other row becomes the
    /// selection.
    pub fn toggle(&mut self, id: u64) -> Option<u64> {
        if self.selected == Some(id) {
            self.selected = None;
        } else {
            self.select(id);
        }
        self.selected
    }

    /// Drop every entry and the selection. Ids keep counting up.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.selected = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::RpcStatus;
    use serde_json::json;

    fn event(n: u64) -> CaptureEvent {
        CaptureEvent::unary(format!("svc/M{n}"), json!({"n": n}), Ok(json!({})))
    }

    fn filled(n: u64, capacity: usize) -> CaptureBuffer {
        let mut buffer = CaptureBuffer::new(capacity);
        for i in 1..=n {
            buffer.push(event(i));
        }
        buffer
    }

    #[test]
    fn hundred_and_first_insert_evicts_oldest() {
        let mut buffer = filled(100, 100);
        assert_eq!(buffer.len(), 100);
        let insertion = buffer.push(event(101));
        assert_eq!(insertion.id, 101);
        assert_eq!(insertion.evicted, Some(1));
        assert_eq!(buffer.len(), 100);
        let ids: Vec<u64> = buffer.entries().map(|e| e.id).collect();
        assert_eq!(ids, (2..=101).collect::<Vec<_>>());
        assert!(buffer.get(1).is_none());
    }

    #[test]
    fn ids_strictly_increase_across_evictions_and_clear() {
        let mut buffer = filled(7, 3);
        buffer.clear();
        let id = buffer.push(event(8)).id;
        assert_eq!(id, 8);
        let mut last = 0;
        for i in 9..20 {
            let id = buffer.push(event(i)).id;
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn evicting_selected_entry_clears_selection() {
        let mut buffer = filled(3, 3);
        assert!(buffer.select(1));
        let insertion = buffer.push(event(4));
        assert!(insertion.selection_cleared);
        assert_eq!(buffer.selected(), None);

        buffer.select(3);
        let insertion = buffer.push(event(5));
        assert!(!insertion.selection_cleared);
        assert_eq!(buffer.selected(), Some(3));
    }

    #[test]
    fn toggle_selects_then_deselects() {
        let mut buffer = filled(2, 10);
        assert_eq!(buffer.toggle(2), Some(2));
        assert_eq!(buffer.toggle(1), Some(1));
        assert_eq!(buffer.toggle(1), None);
        assert!(!buffer.select(99));
    }

    #[test]
    fn text_is_rendered_once_with_absent_fields_kept_absent() {
        let mut buffer = CaptureBuffer::new(4);
        buffer.push(CaptureEvent::stream_ended("svc/Watch"));
        buffer.push(CaptureEvent::unary("svc/Get", json!(null), Err(RpcStatus::new(5, "gone"))));
        let ended = buffer.get(1).unwrap();
        assert_eq!(ended.text.request, None);
        assert_eq!(ended.text.response.as_deref(), Some("Stream ended (EOF)"));
        let failed = buffer.get(2).unwrap();
        assert_eq!(failed.text.request.as_deref(), Some("null"));
        assert!(failed.text.error.as_deref().unwrap().contains("gone"));
    }
}
