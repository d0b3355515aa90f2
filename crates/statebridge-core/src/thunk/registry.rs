use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::types::{ConsumerId, ThunkId};

// ---------------------------------------------------------------------------
// ThunkState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThunkState {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl ThunkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ThunkState::Completed | ThunkState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThunkState::Pending => "pending",
            ThunkState::Executing => "executing",
            ThunkState::Completed => "completed",
            ThunkState::Failed => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Thunk / ThunkSpec
// ---------------------------------------------------------------------------

/// A node in an operation tree.
#[derive(Debug, Clone)]
pub struct Thunk {
    pub id: ThunkId,
    pub source: ConsumerId,
    pub parent_id: Option<ThunkId>,
    pub state: ThunkState,
    pub bypass_lock: bool,
    pub bypass_access_control: bool,
    pub children: BTreeSet<ThunkId>,
    pub error: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl Thunk {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Parameters for [`ThunkRegistry::register`].
#[derive(Debug, Clone)]
pub struct ThunkSpec {
    pub id: ThunkId,
    pub source: ConsumerId,
    pub parent_id: Option<ThunkId>,
    pub bypass_lock: bool,
    pub bypass_access_control: bool,
}

impl ThunkSpec {
    pub fn root(id: ThunkId, source: ConsumerId) -> Self {
        Self {
            id,
            source,
            parent_id: None,
            bypass_lock: false,
            bypass_access_control: false,
        }
    }

    pub fn child(id: ThunkId, source: ConsumerId, parent_id: ThunkId) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::root(id, source)
        }
    }

    pub fn bypassing_lock(mut self) -> Self {
        self.bypass_lock = true;
        self
    }

    pub fn bypassing_access_control(mut self) -> Self {
        self.bypass_access_control = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Snapshots and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThunkSnapshot {
    pub id: ThunkId,
    pub source_consumer_id: ConsumerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ThunkId>,
    pub state: ThunkState,
    pub bypass_lock: bool,
    pub bypass_access_control: bool,
    pub children: Vec<ThunkId>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveOperationsSummary {
    pub version: u64,
    pub thunks: Vec<ThunkSnapshot>,
}

/// Lifecycle notifications published by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum ThunkEvent {
    Registered {
        id: ThunkId,
        parent_id: Option<ThunkId>,
    },
    Started(ThunkId),
    Completed(ThunkId),
    Failed {
        id: ThunkId,
        error: String,
    },
}

// ---------------------------------------------------------------------------
// ThunkRegistry
// ---------------------------------------------------------------------------

/// Arena of in-flight thunks keyed by id.
///
/// Parent/child links are ids, never references, so dropping a tree is an
/// explicit [`ThunkRegistry::evict_tree`]. Terminal transitions are
/// idempotent: duplicate deliveries from the channel are expected.
pub struct ThunkRegistry {
    thunks: HashMap<ThunkId, Thunk>,
    version: u64,
    events: broadcast::Sender<ThunkEvent>,
}

impl Default for ThunkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThunkRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            thunks: HashMap::new(),
            version: 0,
            events,
        }
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ThunkEvent> {
        self.events.subscribe()
    }

    pub fn register(&mut self, spec: ThunkSpec) -> Result<ThunkId> {
        if self.thunks.contains_key(&spec.id) {
            debug!(thunk = %spec.id, "duplicate thunk registration ignored");
            return Ok(spec.id);
        }

        if let Some(parent_id) = &spec.parent_id {
            let parent = self
                .thunks
                .get_mut(parent_id)
                .ok_or_else(|| BridgeError::InvalidParent(parent_id.clone()))?;
            parent.children.insert(spec.id.clone());
        }

        let id = spec.id.clone();
        self.thunks.insert(
            id.clone(),
            Thunk {
                id: spec.id,
                source: spec.source,
                parent_id: spec.parent_id.clone(),
                state: ThunkState::Pending,
                bypass_lock: spec.bypass_lock,
                bypass_access_control: spec.bypass_access_control,
                children: BTreeSet::new(),
                error: None,
                registered_at: Utc::now(),
            },
        );
        self.version += 1;
        self.emit(ThunkEvent::Registered {
            id: id.clone(),
            parent_id: spec.parent_id,
        });
        Ok(id)
    }

    /// Pending → Executing. Returns `true` if the state changed.
    pub fn mark_executing(&mut self, id: &ThunkId) -> bool {
        let Some(thunk) = self.thunks.get_mut(id) else {
            return false;
        };
        if thunk.state != ThunkState::Pending {
            return false;
        }
        thunk.state = ThunkState::Executing;
        self.version += 1;
        self.emit(ThunkEvent::Started(id.clone()));
        true
    }

    /// Moves the thunk to `Completed`. A still-pending thunk passes through
    /// `Executing` first.
    pub fn mark_completed(&mut self, id: &ThunkId) -> bool {
        if !self.begin_terminal(id) {
            return false;
        }
        if let Some(thunk) = self.thunks.get_mut(id) {
            thunk.state = ThunkState::Completed;
        }
        self.version += 1;
        self.emit(ThunkEvent::Completed(id.clone()));
        true
    }

    pub fn mark_failed(&mut self, id: &ThunkId, error: impl Into<String>) -> bool {
        if !self.begin_terminal(id) {
            return false;
        }
        let error = error.into();
        if let Some(thunk) = self.thunks.get_mut(id) {
            thunk.state = ThunkState::Failed;
            thunk.error = Some(error.clone());
        }
        self.version += 1;
        self.emit(ThunkEvent::Failed {
            id: id.clone(),
            error,
        });
        true
    }

    fn begin_terminal(&mut self, id: &ThunkId) -> bool {
        match self.thunks.get(id).map(|t| t.state) {
            None => false,
            Some(state) if state.is_terminal() => false,
            Some(ThunkState::Pending) => {
                self.mark_executing(id);
                true
            }
            Some(_) => true,
        }
    }

    /// True iff the thunk and every transitive descendant is terminal.
    ///
    /// Unknown ids count as complete: trees are only evicted once finished.
    pub fn is_tree_complete(&self, id: &ThunkId) -> bool {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(thunk) = self.thunks.get(current) else {
                continue;
            };
            if !thunk.state.is_terminal() {
                return false;
            }
            stack.extend(thunk.children.iter());
        }
        true
    }

    pub fn get(&self, id: &ThunkId) -> Option<&Thunk> {
        self.thunks.get(id)
    }

    pub fn contains(&self, id: &ThunkId) -> bool {
        self.thunks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.thunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thunks.is_empty()
    }

    /// Walk parent links up to the tree's root.
    pub fn root_of(&self, id: &ThunkId) -> Option<ThunkId> {
        let mut current = self.thunks.get(id)?;
        while let Some(parent_id) = &current.parent_id {
            match self.thunks.get(parent_id) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Some(current.id.clone())
    }

    fn any_in_lineage(&self, id: &ThunkId, pred: impl Fn(&Thunk) -> bool) -> bool {
        let mut next = self.thunks.get(id);
        while let Some(thunk) = next {
            if pred(thunk) {
                return true;
            }
            next = thunk.parent_id.as_ref().and_then(|p| self.thunks.get(p));
        }
        false
    }

    /// True if `id` is `ancestor` or one of its descendants.
    pub fn is_within(&self, id: &ThunkId, ancestor: &ThunkId) -> bool {
        self.any_in_lineage(id, |t| t.id == *ancestor)
    }

    /// A thunk skips the root lock if it or any ancestor sets `bypass_lock`.
    pub fn bypasses_lock(&self, id: &ThunkId) -> bool {
        self.any_in_lineage(id, |t| t.bypass_lock)
    }

    pub fn bypasses_access_control(&self, id: &ThunkId) -> bool {
        self.any_in_lineage(id, |t| t.bypass_access_control)
    }

    /// Remove a whole tree. Returns the number of thunks removed.
    pub fn evict_tree(&mut self, root: &ThunkId) -> usize {
        let mut removed = 0;
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            if let Some(thunk) = self.thunks.remove(&id) {
                stack.extend(thunk.children);
                removed += 1;
            }
        }
        if removed > 0 {
            self.version += 1;
            debug!(thunk = %root, removed, "evicted completed thunk tree");
        }
        removed
    }

    /// Non-terminal thunks started by `consumer`.
    pub fn active_thunks_of(&self, consumer: ConsumerId) -> Vec<ThunkId> {
        let mut ids: Vec<ThunkId> = self
            .thunks
            .values()
            .filter(|t| t.source == consumer && !t.state.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self, id: &ThunkId) -> Option<ThunkSnapshot> {
        self.thunks.get(id).map(|t| ThunkSnapshot {
            id: t.id.clone(),
            source_consumer_id: t.source,
            parent_id: t.parent_id.clone(),
            state: t.state,
            bypass_lock: t.bypass_lock,
            bypass_access_control: t.bypass_access_control,
            children: t.children.iter().cloned().collect(),
            registered_at: t.registered_at,
        })
    }

    pub fn summary(&self) -> ActiveOperationsSummary {
        let mut thunks: Vec<ThunkSnapshot> = self
            .thunks
            .keys()
            .filter_map(|id| self.snapshot(id))
            .collect();
        thunks.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        ActiveOperationsSummary {
            version: self.version,
            thunks,
        }
    }

    fn emit(&self, event: ThunkEvent) {
        // No receivers is fine; observers are optional.
        let _ = self.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
