//! Ordered undo actions.
//!
//! Each setup step that succeeds pushes the action that reverses it. On
//! failure, or on normal teardown, the stack is unwound newest first.

/// LIFO stack of undo actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackStack<T> {
    actions: Vec<T>,
}

impl<T> RollbackStack<T> {
    pub fn new() -> Self {
        Self { actions: Vec::new() }
    }

    /// Record the undo action of a step that just succeeded.
    pub fn push(&mut self, action: T) {
        self.actions.push(action);
    }

    /// Run every recorded action, newest first, leaving the stack empty.
    pub fn unwind(&mut self, mut undo: impl FnMut(T)) {
        while let Some(action) = self.actions.pop() {
            undo(action);
        }
    }

    /// Forget every recorded action without running it.
    pub fn commit(&mut self) {
        self.actions.clear();
    }

    /// Pending actions, oldest first.
    pub fn pending(&self) -> &[T] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<T> Default for RollbackStack<T> {
    fn default() -> Self {
        Self::new()
    }
}
