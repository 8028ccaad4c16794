//! Reference model of the tag router.
//!
//! A deliberately naive list of registrations with the same externally
//! visible behavior as [`zipline_core::Router`]. Property tests drive both
//! with the same operations and compare every answer.

use std::collections::BTreeSet;

use zipline_core::{Registration, RouteError, RouterMode};
use zipline_proto::Tag;

/// One step of a generated router workload.
#[derive(Debug, Clone)]
pub enum RouterOp {
    /// Register a connection
    Add(Registration),
    /// Unregister a connection
    Remove(String),
    /// Resolve subscribers of a tag, optionally for a target
    Route {
        /// Data tag
        tag: Tag,
        /// Wanted target carried by the frame
        target: Option<String>,
    },
}

/// Answer to a [`RouterOp`], comparable between model and real router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterOutcome {
    /// Registration accepted, possibly evicting a connection
    Added {
        /// Connection that lost its name
        evicted: Option<String>,
    },
    /// Registration refused
    Refused(RouteError),
    /// Whether the removed connection was registered
    Removed(bool),
    /// Resolved subscribers in id order
    Routed(Vec<String>),
}

/// Naive router.
#[derive(Debug, Clone)]
pub struct RouterModel {
    mode: RouterMode,
    entries: Vec<Registration>,
}

impl RouterModel {
    /// Empty model with the given policy.
    pub fn new(mode: RouterMode) -> Self {
        Self { mode, entries: Vec::new() }
    }

    /// Apply one operation.
    pub fn apply(&mut self, op: &RouterOp) -> RouterOutcome {
        match op {
            RouterOp::Add(reg) => match self.add(reg.clone()) {
                Ok(evicted) => RouterOutcome::Added { evicted },
                Err(e) => RouterOutcome::Refused(e),
            },
            RouterOp::Remove(conn_id) => RouterOutcome::Removed(self.remove(conn_id)),
            RouterOp::Route { tag, target } => RouterOutcome::Routed(self.route(*tag, target.as_deref())),
        }
    }

    fn add(&mut self, reg: Registration) -> Result<Option<String>, RouteError> {
        let workflow = match &self.mode {
            RouterMode::Workflow(names) if !names.contains(&reg.name) => {
                return Err(RouteError::UnknownFunction { name: reg.name });
            },
            RouterMode::Workflow(_) => true,
            RouterMode::Open => false,
        };

        self.entries.retain(|e| e.conn_id != reg.conn_id);
        let mut evicted = None;
        if workflow {
            if let Some(pos) = self.entries.iter().position(|e| e.name == reg.name) {
                evicted = Some(self.entries.remove(pos).conn_id);
            }
        }
        self.entries.push(reg);
        Ok(evicted)
    }

    fn remove(&mut self, conn_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.conn_id != conn_id);
        self.entries.len() != before
    }

    fn route(&self, tag: Tag, target: Option<&str>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.observe_data_tags.contains(&tag))
            .filter(|e| target.is_none() || e.wanted_target.as_deref() == target)
            .map(|e| e.conn_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Apply `op` to the real router, answering in model terms.
pub fn apply_to_router(router: &zipline_core::Router, op: &RouterOp) -> RouterOutcome {
    match op {
        RouterOp::Add(reg) => match router.add(reg.clone()) {
            Ok(eviction) => RouterOutcome::Added { evicted: eviction.map(|e| e.conn_id) },
            Err(e) => RouterOutcome::Refused(e),
        },
        RouterOp::Remove(conn_id) => RouterOutcome::Removed(router.remove(conn_id)),
        RouterOp::Route { tag, target } => RouterOutcome::Routed(router.route(*tag, target.as_deref())),
    }
}
