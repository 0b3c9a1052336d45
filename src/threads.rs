//! Session lineage bookkeeping.
//!
//! Maps each phase name to the agent session that ran it, with an optional
//! parent link for phases spawned in response to another (retries, second
//! review passes). Lineage is logging metadata only; sessions are never
//! resumed.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ThreadManager {
    sessions: HashMap<String, String>,
    parents: HashMap<String, String>,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, phase: &str, session_id: &str, parent: Option<&str>) {
        if !session_id.is_empty() {
            self.sessions.insert(phase.to_string(), session_id.to_string());
        }
        if let Some(parent) = parent {
            self.parents.insert(phase.to_string(), parent.to_string());
        }
    }

    pub fn session_for(&self, phase: &str) -> Option<&str> {
        self.sessions.get(phase).map(String::as_str)
    }

    pub fn parent_of(&self, phase: &str) -> Option<&str> {
        self.parents.get(phase).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
