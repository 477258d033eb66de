//! Token reassembly: `absent -> streaming -> finalized` per message id.
//!
//! Tokens are applied strictly in arrival order. A finalized or errored
//! message is never reopened; late tokens and duplicate completions for it
//! are ignored.

use std::collections::HashMap;

use tracing::debug;

use crate::model::{Message, Session};

/// What an assembler call did to the session, so callers know what to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The message with this id changed.
    Updated(String),
    /// The frame had no effect (duplicate or late).
    Ignored,
}

/// Per-session token buffers keyed by message id.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffers: HashMap<String, String>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently streaming.
    pub fn active(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_streaming(&self, id: &str) -> bool {
        self.buffers.contains_key(id)
    }

    /// Open a buffer for `id` (or a fresh uuid when the server sent none) and
    /// add an empty partial assistant message to the session.
    pub fn start(&mut self, session: &mut Session, id: Option<String>) -> Applied {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.buffers.contains_key(&id) {
            debug!(message_id = %id, "duplicate stream_start ignored");
            return Applied::Ignored;
        }
        match session.message(&id) {
            Some(existing) if !existing.partial => {
                debug!(message_id = %id, "stream_start for finalized message ignored");
                return Applied::Ignored;
            }
            Some(_) => {}
            None => session.push(Message::streaming(id.clone())),
        }
        self.buffers.insert(id.clone(), String::new());
        Applied::Updated(id)
    }

    /// Append `token` to the buffer for `id` and mirror it into the message.
    ///
    /// A token for an id with no buffer implicitly starts one, unless that
    /// message is already final.
    pub fn push_token(&mut self, session: &mut Session, id: &str, token: &str) -> Applied {
        if !self.buffers.contains_key(id) {
            if let Applied::Ignored = self.start(session, Some(id.to_string())) {
                return Applied::Ignored;
            }
        }
        let Some(buffer) = self.buffers.get_mut(id) else {
            return Applied::Ignored;
        };
        buffer.push_str(token);
        if let Some(message) = session.message_mut(id) {
            message.content.clone_from(buffer);
        }
        session.touch();
        Applied::Updated(id.to_string())
    }

    /// Finalize `id`: prefer the server's `final_content`, else the local buffer.
    pub fn complete(
        &mut self,
        session: &mut Session,
        id: &str,
        final_content: Option<String>,
    ) -> Applied {
        let buffered = self.buffers.remove(id);
        match session.message_mut(id) {
            Some(message) if message.partial || buffered.is_some() => {
                message.content = final_content.or(buffered).unwrap_or_default();
                message.partial = false;
            }
            Some(_) => {
                debug!(message_id = %id, "duplicate stream_complete ignored");
                return Applied::Ignored;
            }
            None => match final_content {
                // completion without any prior start still delivers a message
                Some(content) => {
                    session.push(Message::new(id, crate::model::Role::Assistant, content));
                    return Applied::Updated(id.to_string());
                }
                None => return Applied::Ignored,
            },
        }
        session.touch();
        Applied::Updated(id.to_string())
    }

    /// Mark `id` as failed. Errored messages are terminal.
    pub fn fail(&mut self, session: &mut Session, id: &str, error: &str) -> Applied {
        let had_buffer = self.buffers.remove(id).is_some();
        match session.message_mut(id) {
            Some(message) if message.partial || had_buffer => {
                message.error = Some(error.to_string());
                message.partial = false;
                session.touch();
                Applied::Updated(id.to_string())
            }
            _ => Applied::Ignored,
        }
    }

    /// Fail every message still streaming. Returns the affected ids.
    pub fn fail_all(&mut self, session: &mut Session, error: &str) -> Vec<String> {
        let mut ids: Vec<String> = self.buffers.keys().cloned().collect();
        for id in session.partial_ids() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids.into_iter()
            .filter_map(|id| match self.fail(session, &id, error) {
                Applied::Updated(id) => Some(id),
                Applied::Ignored => None,
            })
            .collect()
    }

    /// Drop all buffers without touching messages.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
