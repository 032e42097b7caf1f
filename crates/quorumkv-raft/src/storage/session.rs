//! Replicated client-session registry.
//!
//! Every replica applies the same register, unregister and propose
//! entries in the same order, so every replica's registry is identical
//! and a retried proposal is answered from the cache on any new leader.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::CommandResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ClientSession {
    responded_to: u64,
    /// Results of proposals the client has not acknowledged yet.
    history: BTreeMap<u64, CommandResult>,
}

/// What to do with a proposal carrying a session header.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCheck {
    /// The client id is not registered.
    Expired,
    /// Already applied; answer with the stored result.
    Cached(CommandResult),
    /// Already applied and acknowledged; the result is gone.
    Responded,
    /// Not seen before; apply it.
    New,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRegistry {
    sessions: BTreeMap<u64, ClientSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the client was already registered.
    pub fn register(&mut self, client_id: u64) -> bool {
        if self.sessions.contains_key(&client_id) {
            return false;
        }
        self.sessions.insert(client_id, ClientSession::default());
        true
    }

    /// Returns false if the client was not registered.
    pub fn unregister(&mut self, client_id: u64) -> bool {
        self.sessions.remove(&client_id).is_some()
    }

    pub fn contains(&self, client_id: u64) -> bool {
        self.sessions.contains_key(&client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Classify a proposal and drop results the client has acknowledged.
    pub fn check(&mut self, client_id: u64, series_id: u64, responded_to: u64) -> SessionCheck {
        let Some(session) = self.sessions.get_mut(&client_id) else {
            return SessionCheck::Expired;
        };

        if responded_to > session.responded_to {
            session.responded_to = responded_to;
            session.history.retain(|series, _| *series > responded_to);
        }

        if let Some(result) = session.history.get(&series_id) {
            return SessionCheck::Cached(result.clone());
        }
        if series_id <= session.responded_to {
            return SessionCheck::Responded;
        }
        SessionCheck::New
    }

    /// Store the result of a newly applied proposal.
    pub fn record(&mut self, client_id: u64, series_id: u64, result: CommandResult) {
        if let Some(session) = self.sessions.get_mut(&client_id) {
            session.history.insert(series_id, result);
        }
    }
}
