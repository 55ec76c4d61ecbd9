use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

/// A cancellable lifetime that subscriptions and pending fetches are bound
/// to. Cancelling a parent cancels its children. Clones share one token.
#[derive(Clone, Debug, Default)]
pub struct Scope(CancellationToken);

impl Scope {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// A scope that ends when `self` ends, or earlier when cancelled itself.
    pub fn child(&self) -> Self {
        Self(self.0.child_token())
    }

    /// Safe to call any number of times.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.0.cancelled()
    }

    /// Cancels the scope when the returned guard is dropped.
    pub fn guard(&self) -> DropGuard {
        self.0.clone().drop_guard()
    }
}

#[cfg(test)]
mod tests {
    use super::Scope;

    #[test]
    fn cancel_propagates_to_children_only() {
        let parent = Scope::new();
        let child = parent.child();
        child.cancel();
        child.cancel();
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn guard_cancels_on_drop() {
        let scope = Scope::new();
        {
            let _guard = scope.guard();
        }
        assert!(scope.is_cancelled());
    }
}
