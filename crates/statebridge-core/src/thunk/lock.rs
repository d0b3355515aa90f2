use tracing::debug;

use super::registry::ThunkRegistry;
use crate::types::{Action, ThunkId};

/// How an action relates to the root lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockScope {
    /// The action or one of its owning thunk's ancestors bypasses the lock.
    Exempt,
    /// Not part of any registered thunk.
    Standalone,
    /// Belongs to the tree rooted at this thunk.
    Tree(ThunkId),
}

impl LockScope {
    pub fn of(action: &Action, registry: &ThunkRegistry) -> Self {
        if action.bypass_lock {
            return LockScope::Exempt;
        }
        let Some(owner) = action
            .parent_thunk_id
            .as_ref()
            .filter(|id| registry.contains(id))
        else {
            return LockScope::Standalone;
        };
        if registry.bypasses_lock(owner) {
            return LockScope::Exempt;
        }
        match registry.root_of(owner) {
            Some(root) => LockScope::Tree(root),
            None => LockScope::Standalone,
        }
    }
}

/// Serializes independent root operation trees.
///
/// At most one non-bypassing root holds the lock; every thunk in the holder's
/// tree passes through freely.
#[derive(Debug, Default)]
pub struct RootLock {
    holder: Option<ThunkId>,
}

impl RootLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Option<&ThunkId> {
        self.holder.as_ref()
    }

    pub fn is_free(&self) -> bool {
        self.holder.is_none()
    }

    /// True if the action's root already holds the lock, needs none, or the
    /// lock is free.
    pub fn can_process_action(&self, action: &Action, registry: &ThunkRegistry) -> bool {
        match LockScope::of(action, registry) {
            LockScope::Exempt => true,
            LockScope::Standalone => self.holder.is_none(),
            LockScope::Tree(root) => self.holder.as_ref().map_or(true, |h| *h == root),
        }
    }

    /// Claim the lock on behalf of the action's root if it is free.
    ///
    /// Bypassing actions and actions re-entering the holder's tree always
    /// succeed. Standalone actions succeed when the lock is free but do not
    /// hold it past their own execution.
    pub fn try_acquire_root_lock(&mut self, action: &Action, registry: &ThunkRegistry) -> bool {
        match LockScope::of(action, registry) {
            LockScope::Exempt => true,
            LockScope::Standalone => self.holder.is_none(),
            LockScope::Tree(root) => match &self.holder {
                Some(holder) => *holder == root,
                None => {
                    debug!(thunk = %root, action_id = %action.id, "root lock acquired");
                    self.holder = Some(root);
                    true
                }
            },
        }
    }

    /// Called whenever a thunk completes or fails. Clears the holder once the
    /// holder's entire tree is terminal.
    ///
    /// `id` may be any thunk of the tree; a child that finishes after its
    /// root still releases the root's lock.
    pub fn release_root_lock_if_complete(&mut self, id: &ThunkId, registry: &ThunkRegistry) -> bool {
        let Some(holder) = &self.holder else {
            return false;
        };
        let root = registry.root_of(id).unwrap_or_else(|| id.clone());
        if *holder != root || !registry.is_tree_complete(holder) {
            return false;
        }
        debug!(thunk = %root, "root lock released");
        self.holder = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thunk::registry::ThunkSpec;
    use crate::types::ConsumerId;

    fn id(s: &str) -> ThunkId {
        ThunkId::from(s)
    }

    fn action_in(thunk: &str) -> Action {
        Action::new("counter:double").in_thunk(id(thunk))
    }

    fn two_roots() -> ThunkRegistry {
        let mut reg = ThunkRegistry::new();
        reg.register(ThunkSpec::root(id("a"), ConsumerId(1))).unwrap();
        reg.register(ThunkSpec::child(id("a-child"), ConsumerId(1), id("a")))
            .unwrap();
        reg.register(ThunkSpec::root(id("b"), ConsumerId(2))).unwrap();
        reg
    }

    #[test]
    fn first_root_acquires_second_is_refused() {
        let reg = two_roots();
        let mut lock = RootLock::new();

        assert!(lock.try_acquire_root_lock(&action_in("a"), &reg));
        assert_eq!(lock.holder(), Some(&id("a")));

        assert!(!lock.can_process_action(&action_in("b"), &reg));
        assert!(!lock.try_acquire_root_lock(&action_in("b"), &reg));
        assert_eq!(lock.holder(), Some(&id("a")));
    }

    #[test]
    fn child_reenters_holders_tree() {
        let reg = two_roots();
        let mut lock = RootLock::new();
        lock.try_acquire_root_lock(&action_in("a"), &reg);

        assert!(lock.can_process_action(&action_in("a-child"), &reg));
        assert!(lock.try_acquire_root_lock(&action_in("a-child"), &reg));
    }

    #[test]
    fn child_action_acquires_for_its_root() {
        let reg = two_roots();
        let mut lock = RootLock::new();
        assert!(lock.try_acquire_root_lock(&action_in("a-child"), &reg));
        assert_eq!(lock.holder(), Some(&id("a")));
    }

    #[test]
    fn bypass_action_always_passes() {
        let reg = two_roots();
        let mut lock = RootLock::new();
        lock.try_acquire_root_lock(&action_in("a"), &reg);

        let bypass = Action::new("counter:increment").bypassing_lock();
        assert!(lock.can_process_action(&bypass, &reg));
        assert!(lock.try_acquire_root_lock(&bypass, &reg));

        let bypass_in_b = action_in("b").bypassing_lock();
        assert!(lock.try_acquire_root_lock(&bypass_in_b, &reg));
        assert_eq!(lock.holder(), Some(&id("a")));
    }

    #[test]
    fn bypassing_thunk_exempts_its_actions() {
        let mut reg = two_roots();
        reg.register(ThunkSpec::root(id("fast"), ConsumerId(3)).bypassing_lock())
            .unwrap();
        let mut lock = RootLock::new();
        lock.try_acquire_root_lock(&action_in("a"), &reg);

        assert!(lock.try_acquire_root_lock(&action_in("fast"), &reg));
        assert_eq!(lock.holder(), Some(&id("a")));
    }

    #[test]
    fn standalone_waits_for_held_lock_without_claiming() {
        let reg = two_roots();
        let mut lock = RootLock::new();
        let plain = Action::new("counter:increment");

        assert!(lock.try_acquire_root_lock(&plain, &reg));
        assert!(lock.is_free());

        lock.try_acquire_root_lock(&action_in("a"), &reg);
        assert!(!lock.can_process_action(&plain, &reg));
    }

    #[test]
    fn action_for_unknown_thunk_is_standalone() {
        let reg = two_roots();
        assert_eq!(
            LockScope::of(&action_in("evicted"), &reg),
            LockScope::Standalone
        );
    }

    #[test]
    fn release_waits_for_whole_tree() {
        let mut reg = two_roots();
        let mut lock = RootLock::new();
        lock.try_acquire_root_lock(&action_in("a"), &reg);

        reg.mark_completed(&id("a"));
        assert!(!lock.release_root_lock_if_complete(&id("a"), &reg));
        assert_eq!(lock.holder(), Some(&id("a")));

        reg.mark_completed(&id("a-child"));
        assert!(lock.release_root_lock_if_complete(&id("a-child"), &reg));
        assert!(lock.is_free());

        assert!(lock.try_acquire_root_lock(&action_in("b"), &reg));
        assert_eq!(lock.holder(), Some(&id("b")));
    }

    #[test]
    fn release_ignores_other_trees() {
        let mut reg = two_roots();
        let mut lock = RootLock::new();
        lock.try_acquire_root_lock(&action_in("a"), &reg);

        reg.mark_completed(&id("b"));
        assert!(!lock.release_root_lock_if_complete(&id("b"), &reg));
        assert_eq!(lock.holder(), Some(&id("a")));
    }
}
