//! Local track queue
//!
//! Ordered list of the room's audio sources plus the selected one. Next and
//! previous only move the selection; the caller decides whether to play.

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub audio_id: String,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct TrackQueue {
    entries: Vec<QueueEntry>,
    selected: Option<String>,
    shuffled: bool,
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source, or rename it if already queued. The first source
    /// added becomes the selection.
    pub fn add(&mut self, audio_id: &str, name: &str) {
        match self.entries.iter_mut().find(|e| e.audio_id == audio_id) {
            Some(entry) => entry.name = name.to_string(),
            None => self.entries.push(QueueEntry {
                audio_id: audio_id.to_string(),
                name: name.to_string(),
            }),
        }
        if self.selected.is_none() {
            self.selected = Some(audio_id.to_string());
        }
    }

    /// Select a queued source. False if it is not queued.
    pub fn select(&mut self, audio_id: &str) -> bool {
        if !self.contains(audio_id) {
            return false;
        }
        self.selected = Some(audio_id.to_string());
        true
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn contains(&self, audio_id: &str) -> bool {
        self.entries.iter().any(|e| e.audio_id == audio_id)
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffled
    }

    /// Flip shuffle, returning the new setting
    pub fn toggle_shuffle(&mut self) -> bool {
        self.shuffled = !self.shuffled;
        self.shuffled
    }

    fn selected_index(&self) -> Option<usize> {
        let selected = self.selected.as_deref()?;
        self.entries.iter().position(|e| e.audio_id == selected)
    }

    /// Advance the selection: the following entry (wrapping), or when
    /// shuffled a random entry other than the current one.
    pub fn next(&mut self) -> Option<&str> {
        if self.entries.len() <= 1 {
            return None;
        }
        let current = self.selected_index()?;
        let next = if self.shuffled {
            // Draw from the other n-1 entries
            let pick = rand::thread_rng().gen_range(0..self.entries.len() - 1);
            if pick >= current {
                pick + 1
            } else {
                pick
            }
        } else {
            (current + 1) % self.entries.len()
        };
        self.selected = Some(self.entries[next].audio_id.clone());
        self.selected.as_deref()
    }

    /// Step back one entry, wrapping. Not available while shuffled.
    pub fn previous(&mut self) -> Option<&str> {
        if self.entries.len() <= 1 || self.shuffled {
            return None;
        }
        let current = self.selected_index()?;
        let previous = if current == 0 {
            self.entries.len() - 1
        } else {
            current - 1
        };
        self.selected = Some(self.entries[previous].audio_id.clone());
        self.selected.as_deref()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.selected = None;
    }
}
