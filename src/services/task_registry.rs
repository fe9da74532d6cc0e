//! Authoritative task store and its derived indices.
//!
//! [`TaskRegistry`] does pure data operations only, with no I/O. The
//! background manager owns exactly one of them behind one mutex
//! ([`SharedRegistry`]) and never holds that lock across an await point.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;

use crate::domain::models::{Task, TaskId, TaskStatus};

/// Purpose of a per-task timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Re-check of an idle signal that arrived before the minimum run time
    IdleDeferral,
    /// Removal of a finished task after the retention window
    Purge,
}

/// Registry shared between the manager, its drain loops and its timers.
#[derive(Clone, Default)]
pub struct SharedRegistry(Arc<Mutex<TaskRegistry>>);

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the registry. Never hold the guard across an await point.
    pub fn lock(&self) -> MutexGuard<'_, TaskRegistry> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, Task>,
    by_session: HashMap<String, TaskId>,
    /// parent session -> tasks launched from it, in launch order
    children: HashMap<String, Vec<TaskId>>,
    /// parent session -> tasks not yet delivered a final notice
    pending_by_parent: HashMap<String, HashSet<TaskId>>,
    queues: HashMap<String, VecDeque<TaskId>>,
    /// keys with a live drain loop
    processing: HashSet<String>,
    timers: HashMap<(TaskId, TimerKind), AbortHandle>,
    /// parent session -> finished tasks awaiting delivery
    notifications: HashMap<String, Vec<TaskId>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: Task) {
        if let Some(session_id) = &task.session_id {
            self.by_session.insert(session_id.clone(), task.id);
        }
        let siblings = self.children.entry(task.parent_session_id.clone()).or_default();
        if !siblings.contains(&task.id) {
            siblings.push(task.id);
        }
        self.tasks.insert(task.id, task);
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn find_by_session(&self, session_id: &str) -> Option<&Task> {
        self.by_session
            .get(session_id)
            .and_then(|id| self.tasks.get(id))
    }

    /// Attach an execution context to a task.
    pub fn bind_session(&mut self, id: TaskId, session_id: &str) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.session_id = Some(session_id.to_string());
            self.by_session.insert(session_id.to_string(), id);
        }
    }

    /// Move a task under a new parent, carrying its pending membership along.
    pub fn reparent(&mut self, id: TaskId, parent_session_id: &str, parent_message_id: &str) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let old_parent =
            std::mem::replace(&mut task.parent_session_id, parent_session_id.to_string());
        task.parent_message_id = parent_message_id.to_string();
        if old_parent == parent_session_id {
            return;
        }

        if let Some(siblings) = self.children.get_mut(&old_parent) {
            siblings.retain(|sibling| *sibling != id);
            if siblings.is_empty() {
                self.children.remove(&old_parent);
            }
        }
        self.children
            .entry(parent_session_id.to_string())
            .or_default()
            .push(id);

        let was_pending = self
            .pending_by_parent
            .get_mut(&old_parent)
            .is_some_and(|set| set.remove(&id));
        self.drop_empty_pending_set(&old_parent);
        if was_pending {
            self.track_pending(parent_session_id, id);
        }
    }

    /// Remove a task and every index entry that mentions it.
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let task = self.tasks.remove(&id)?;
        if let Some(session_id) = &task.session_id {
            if self.by_session.get(session_id) == Some(&id) {
                self.by_session.remove(session_id);
            }
        }
        if let Some(siblings) = self.children.get_mut(&task.parent_session_id) {
            siblings.retain(|sibling| *sibling != id);
            if siblings.is_empty() {
                self.children.remove(&task.parent_session_id);
            }
        }
        self.untrack_pending(&task.parent_session_id, id);
        if let Some(key) = &task.concurrency_group {
            self.remove_from_queue(key, id);
        }
        self.clear_notifications_for_task(id);
        self.clear_timers_for(id);
        Some(task)
    }

    /// Tasks launched directly from `parent_session_id`.
    pub fn children_of(&self, parent_session_id: &str) -> Vec<&Task> {
        self.children
            .get(parent_session_id)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    /// Every task below `session_id`, walking parent -> children through the
    /// children's own sessions. Visits each session once even if the
    /// relation is not a forest.
    pub fn descendants_of(&self, session_id: &str) -> Vec<TaskId> {
        let mut found = Vec::new();
        let mut seen_sessions = HashSet::from([session_id.to_string()]);
        let mut frontier = vec![session_id.to_string()];

        while let Some(parent) = frontier.pop() {
            for child in self.children_of(&parent) {
                if found.contains(&child.id) {
                    continue;
                }
                found.push(child.id);
                if let Some(child_session) = &child.session_id {
                    if seen_sessions.insert(child_session.clone()) {
                        frontier.push(child_session.clone());
                    }
                }
            }
        }
        found
    }

    pub fn running_tasks(&self) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Running)
            .collect()
    }

    pub fn has_running(&self) -> bool {
        self.tasks
            .values()
            .any(|task| task.status == TaskStatus::Running)
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    // ---- pending-per-parent ----

    pub fn track_pending(&mut self, parent_session_id: &str, id: TaskId) {
        self.pending_by_parent
            .entry(parent_session_id.to_string())
            .or_default()
            .insert(id);
    }

    /// Drop a task from its parent's pending set; returns how many remain.
    pub fn untrack_pending(&mut self, parent_session_id: &str, id: TaskId) -> usize {
        let remaining = self
            .pending_by_parent
            .get_mut(parent_session_id)
            .map_or(0, |set| {
                set.remove(&id);
                set.len()
            });
        self.drop_empty_pending_set(parent_session_id);
        remaining
    }

    pub fn pending_count(&self, parent_session_id: &str) -> usize {
        self.pending_by_parent
            .get(parent_session_id)
            .map_or(0, HashSet::len)
    }

    #[cfg(test)]
    pub fn is_pending_for(&self, parent_session_id: &str, id: TaskId) -> bool {
        self.pending_by_parent
            .get(parent_session_id)
            .is_some_and(|set| set.contains(&id))
    }

    #[cfg(test)]
    pub fn has_pending_set(&self, parent_session_id: &str) -> bool {
        self.pending_by_parent.contains_key(parent_session_id)
    }

    pub fn remove_pending_set(&mut self, parent_session_id: &str) {
        self.pending_by_parent.remove(parent_session_id);
    }

    fn drop_empty_pending_set(&mut self, parent_session_id: &str) {
        if self
            .pending_by_parent
            .get(parent_session_id)
            .is_some_and(HashSet::is_empty)
        {
            self.pending_by_parent.remove(parent_session_id);
        }
    }

    // ---- per-key dispatch queues ----

    pub fn enqueue(&mut self, key: &str, id: TaskId) {
        self.queues.entry(key.to_string()).or_default().push_back(id);
    }

    pub fn queue_head(&self, key: &str) -> Option<TaskId> {
        self.queues.get(key).and_then(|queue| queue.front().copied())
    }

    pub fn queue_len(&self, key: &str) -> usize {
        self.queues.get(key).map_or(0, VecDeque::len)
    }

    /// Pop the head of a queue if it is still `id`.
    pub fn pop_head(&mut self, key: &str, id: TaskId) {
        if let Some(queue) = self.queues.get_mut(key) {
            if queue.front() == Some(&id) {
                queue.pop_front();
            }
            if queue.is_empty() {
                self.queues.remove(key);
            }
        }
    }

    pub fn remove_from_queue(&mut self, key: &str, id: TaskId) -> bool {
        let Some(queue) = self.queues.get_mut(key) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|queued| *queued != id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.queues.remove(key);
        }
        removed
    }

    /// Mark `key` as having a live drain loop. False if one already runs.
    pub fn claim_processor(&mut self, key: &str) -> bool {
        self.processing.insert(key.to_string())
    }

    pub fn retire_processor(&mut self, key: &str) {
        self.processing.remove(key);
    }

    #[cfg(test)]
    pub fn is_processing(&self, key: &str) -> bool {
        self.processing.contains(key)
    }

    // ---- notification backlog ----

    pub fn mark_for_notification(&mut self, parent_session_id: &str, id: TaskId) {
        let backlog = self
            .notifications
            .entry(parent_session_id.to_string())
            .or_default();
        if !backlog.contains(&id) {
            backlog.push(id);
        }
    }

    pub fn pending_notifications(&self, parent_session_id: &str) -> Vec<&Task> {
        self.notifications
            .get(parent_session_id)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn clear_notifications(&mut self, parent_session_id: &str) {
        self.notifications.remove(parent_session_id);
    }

    pub fn clear_notifications_for_task(&mut self, id: TaskId) {
        self.notifications.retain(|_, backlog| {
            backlog.retain(|queued| *queued != id);
            !backlog.is_empty()
        });
    }

    // ---- timers ----

    /// Install a timer, aborting any previous timer of the same kind.
    pub fn set_timer(&mut self, id: TaskId, kind: TimerKind, handle: AbortHandle) {
        if let Some(previous) = self.timers.insert((id, kind), handle) {
            previous.abort();
        }
    }

    pub fn has_timer(&self, id: TaskId, kind: TimerKind) -> bool {
        self.timers.contains_key(&(id, kind))
    }

    /// Forget a timer without aborting it; used by the timer itself when it fires.
    pub fn take_timer(&mut self, id: TaskId, kind: TimerKind) -> Option<AbortHandle> {
        self.timers.remove(&(id, kind))
    }

    pub fn clear_timer(&mut self, id: TaskId, kind: TimerKind) {
        if let Some(handle) = self.timers.remove(&(id, kind)) {
            handle.abort();
        }
    }

    pub fn clear_timers_for(&mut self, id: TaskId) {
        self.clear_timer(id, TimerKind::IdleDeferral);
        self.clear_timer(id, TimerKind::Purge);
    }

    pub fn clear_all_timers(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Drop all state. Timers are aborted.
    pub fn clear(&mut self) {
        self.clear_all_timers();
        self.tasks.clear();
        self.by_session.clear();
        self.children.clear();
        self.pending_by_parent.clear();
        self.queues.clear();
        self.processing.clear();
        self.notifications.clear();
    }
}
