//! Echo suppression: telling a session's own writes, echoed back by its
//! subscription, apart from genuine remote changes.
//!
//! Protocol, per open record:
//!
//! 1. Before a write the suppressor enters the suppressing state.
//! 2. Once the store commits, the committed timestamp is remembered and the
//!    suppressing state is kept for a short window after it.
//! 3. Events tagged with this session's editor id are echoes and are dropped.
//!    Events tagged by another editor are applied whenever they are newer
//!    than anything applied so far, window or not.
//! 4. Untagged events (older writers) seen while suppressing are applied only
//!    if strictly newer than our own write; otherwise they are deferred, and
//!    when the window closes the session re-reads the record instead of
//!    silently losing a concurrent update.
//! 5. Nothing at or below the last applied timestamp is ever applied.

use std::time::Duration;

use tokio::time::Instant;

use crate::record::{EditorId, Timestamp};

/// What to do with one subscription event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Apply,
    /// Our own write coming back.
    Echo,
    /// Not newer than what is already shown.
    Stale,
    /// Possibly a concurrent remote write; re-read once the window closes.
    Deferred,
}

#[derive(Debug)]
pub struct EchoSuppressor {
    editor: EditorId,
    window: Duration,
    in_flight: bool,
    suppress_until: Option<Instant>,
    written: Option<Timestamp>,
    last_applied: Timestamp,
    deferred: Option<Timestamp>,
}

impl EchoSuppressor {
    pub fn new(editor: EditorId, window: Duration) -> Self {
        EchoSuppressor {
            editor,
            window,
            in_flight: false,
            suppress_until: None,
            written: None,
            last_applied: Timestamp::ZERO,
            deferred: None,
        }
    }

    pub fn editor(&self) -> &EditorId {
        &self.editor
    }

    pub fn last_applied(&self) -> Timestamp {
        self.last_applied
    }

    /// Baseline after a full read of the record.
    pub fn loaded(&mut self, ts: Timestamp) {
        self.last_applied = self.last_applied.max(ts);
    }

    pub fn begin_write(&mut self) {
        self.in_flight = true;
    }

    pub fn finish_write(&mut self, committed: Timestamp, now: Instant) {
        self.in_flight = false;
        self.written = Some(committed);
        self.last_applied = self.last_applied.max(committed);
        self.suppress_until = Some(now + self.window);
        if self.deferred.is_some_and(|ts| ts <= committed) {
            self.deferred = None;
        }
    }

    /// The write failed; nothing will echo back.
    pub fn abort_write(&mut self, now: Instant) {
        self.in_flight = false;
        self.suppress_until = Some(now + self.window);
    }

    pub fn is_suppressing(&self, now: Instant) -> bool {
        self.in_flight || self.suppress_until.is_some_and(|until| now < until)
    }

    /// When the current suppression window closes, if one is open.
    pub fn window_deadline(&self) -> Option<Instant> {
        if self.in_flight {
            return None;
        }
        self.suppress_until
    }

    /// Close an expired window. Returns `true` when an event was deferred
    /// during it and the record must be re-read.
    pub fn expire_window(&mut self, now: Instant) -> bool {
        match self.suppress_until {
            Some(until) if !self.in_flight && now >= until => {
                self.suppress_until = None;
                self.deferred
                    .take()
                    .is_some_and(|ts| ts > self.last_applied)
            }
            _ => false,
        }
    }

    pub fn classify(&mut self, origin: Option<&EditorId>, ts: Timestamp, now: Instant) -> Delivery {
        if origin == Some(&self.editor) {
            self.last_applied = self.last_applied.max(ts);
            return Delivery::Echo;
        }
        if ts <= self.last_applied {
            return Delivery::Stale;
        }
        if origin.is_none() && self.is_suppressing(now) {
            let newer_than_ours = !self.in_flight && self.written.is_some_and(|w| ts > w);
            if !newer_than_ours {
                self.deferred = Some(self.deferred.map_or(ts, |d| d.max(ts)));
                return Delivery::Deferred;
            }
        }
        self.last_applied = ts;
        Delivery::Apply
    }
}
