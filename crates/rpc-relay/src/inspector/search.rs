//! Query filtering and in-detail match navigation.

use super::buffer::{CaptureBuffer, CaptureEntry, Insertion};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Request,
    Response,
    Error,
}

/// One occurrence of the query inside the selected entry's detail text.
/// `start..end` is a byte range into that section's text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Match {
    pub section: Section,
    pub start: usize,
    pub end: usize,
}

/// Case-insensitive, non-overlapping occurrences of `needle` in `haystack`.
pub fn find_all(haystack: &str, needle: &str) -> Vec<(usize, usize)> {
    let needle: Vec<char> = needle.chars().collect();
    if needle.is_empty() {
        return Vec::new();
    }
    let chars: Vec<(usize, char)> = haystack.char_indices().collect();
    let mut found = Vec::new();
    let mut i = 0;
    while i + needle.len() <= chars.len() {
        let hit = needle
            .iter()
            .zip(&chars[i..])
            .all(|(n, (_, c))| same_char(*n, *c));
        if hit {
            let start = chars[i].0;
            let end = chars
                .get(i + needle.len())
                .map(|(pos, _)| *pos)
                .unwrap_or(haystack.len());
            found.push((start, end));
            i += needle.len();
        } else {
            i += 1;
        }
    }
    found
}

fn same_char(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    !find_all(haystack, needle).is_empty()
}

/// Method name and every present payload text. Absent payloads are not
/// searchable.
pub fn entry_matches(entry: &CaptureEntry, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    let text = &entry.text;
    contains_ci(&entry.event.method, needle)
        || [&text.request, &text.response, &text.error]
            .into_iter()
            .flatten()
            .any(|t| contains_ci(t, needle))
}

#[derive(Default)]
pub struct SearchEngine {
    query: String,
    matches: Vec<Match>,
    current: usize,
    navigating: bool,
    user_initiated: bool,
    /// Selection the user chose; query changes never move it.
    pinned: Option<u64>,
}

impl SearchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    fn needle(&self) -> &str {
        self.query.trim()
    }

    pub fn is_active(&self) -> bool {
        !self.needle().is_empty()
    }

    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_match(&self) -> Option<&Match> {
        self.matches.get(self.current)
    }

    /// Entries passing the query, in insertion order.
    pub fn filtered<'a>(&self, buffer: &'a CaptureBuffer) -> Vec<&'a CaptureEntry> {
        let needle = self.needle();
        buffer
            .entries()
            .filter(|e| entry_matches(e, needle))
            .collect()
    }

    pub fn set_query(&mut self, query: &str, buffer: &mut CaptureBuffer) {
        self.query = query.to_string();
        self.perform(buffer);
    }

    /// Re-run the search: auto-select when nothing is selected, or when an
    /// automatic selection got filtered out, then recompute the detail
    /// matches.
    pub fn perform(&mut self, buffer: &mut CaptureBuffer) {
        if self.is_active() && !self.navigating && !self.user_initiated {
            let filtered = self.filtered(buffer);
            let selected = buffer.selected();
            let replaceable = match selected {
                None => true,
                Some(id) => {
                    selected != self.pinned && !filtered.iter().any(|e| e.id == id)
                }
            };
            let first = filtered.first().map(|e| e.id);
            if replaceable {
                if let Some(first) = first {
                    buffer.select(first);
                }
            }
        }
        self.refresh_matches(buffer);
    }

    /// Recompute matches for the selected entry and reset the cursor.
    pub fn refresh_matches(&mut self, buffer: &CaptureBuffer) {
        self.matches.clear();
        self.current = 0;
        if !self.is_active() {
            return;
        }
        let Some(entry) = buffer.selected_entry() else {
            return;
        };
        let needle = self.needle();
        let sections = [
            (Section::Request, &entry.text.request),
            (Section::Response, &entry.text.response),
            (Section::Error, &entry.text.error),
        ];
        let mut matches = Vec::new();
        for (section, text) in sections {
            if let Some(text) = text {
                matches.extend(
                    find_all(text, needle)
                        .into_iter()
                        .map(|(start, end)| Match { section, start, end }),
                );
            }
        }
        self.matches = matches;
    }

    /// A row click. Auto-selection stays out of the way for this one change.
    pub fn select_by_user(&mut self, id: u64, buffer: &mut CaptureBuffer) -> Option<u64> {
        self.user_initiated = true;
        let selected = buffer.toggle(id);
        self.pinned = selected;
        self.perform(buffer);
        self.user_initiated = false;
        selected
    }

    /// Treat an arrival-time selection like a user one.
    pub fn select_quietly(&mut self, id: u64, buffer: &mut CaptureBuffer) {
        self.user_initiated = true;
        buffer.select(id);
        self.perform(buffer);
        self.user_initiated = false;
    }

    /// Navigation is only meaningful with a query and something to show.
    pub fn can_navigate(&self, buffer: &CaptureBuffer) -> bool {
        self.is_active() && !self.filtered(buffer).is_empty()
    }

    pub fn next(&mut self, buffer: &mut CaptureBuffer) -> bool {
        self.step(buffer, true)
    }

    pub fn prev(&mut self, buffer: &mut CaptureBuffer) -> bool {
        self.step(buffer, false)
    }

    fn step(&mut self, buffer: &mut CaptureBuffer, forward: bool) -> bool {
        if !self.can_navigate(buffer) {
            return false;
        }
        let total = self.matches.len();
        if total > 0 {
            self.current = if forward {
                (self.current + 1) % total
            } else {
                (self.current + total - 1) % total
            };
            return true;
        }

        // nothing to highlight in the open detail: walk the filtered list
        let filtered: Vec<u64> = self.filtered(buffer).iter().map(|e| e.id).collect();
        let position = buffer
            .selected()
            .and_then(|id| filtered.iter().position(|f| *f == id));
        let last = filtered.len() - 1;
        let target = match (position, forward) {
            (Some(i), true) if i < last => i + 1,
            (_, true) => 0,
            (Some(i), false) if i > 0 => i - 1,
            (_, false) => last,
        };

        self.navigating = true;
        buffer.select(filtered[target]);
        self.pinned = Some(filtered[target]);
        self.perform(buffer);
        self.navigating = false;
        true
    }

    /// `"<current+1>/<total>"`, or `"0/0"` with nothing to highlight.
    pub fn count_label(&self) -> String {
        if self.matches.is_empty() {
            "0/0".to_string()
        } else {
            format!("{}/{}", self.current + 1, self.matches.len())
        }
    }

    /// The entry a user picked, if it is still the one to keep.
    pub fn pinned(&self) -> Option<u64> {
        self.pinned
    }

    /// Follow an insertion that evicted the selected entry.
    pub fn inserted(&mut self, insertion: &Insertion, buffer: &CaptureBuffer) {
        if insertion.selection_cleared {
            self.pinned = None;
            self.refresh_matches(buffer);
        }
    }

    /// Forget matches after the buffer was cleared.
    pub fn reset(&mut self) {
        self.matches.clear();
        self.current = 0;
        self.pinned = None;
    }
}
