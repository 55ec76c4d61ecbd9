use cordstate_models::event::{EntityKind, Op};
use dashmap::DashMap;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tracing::{error, trace};

use crate::{
    change::{ChangeStream, Notification},
    scope::Scope,
};

/// Matches events whose operation and declared entity kind are both equal.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Filter {
    pub op: Op,
    pub kind: EntityKind,
}

impl Filter {
    pub const fn new(op: Op, kind: EntityKind) -> Self {
        Self { op, kind }
    }

    pub fn matches(&self, notification: &Notification) -> bool {
        self.op == notification.op && self.kind == notification.kind
    }
}

/// Identifies a registration. Tokens increase in registration order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SubscriptionToken(u64);

type Handler = Box<dyn FnMut(&Notification) + Send>;

struct Registration {
    filters: Vec<Filter>,
    scope: Scope,
    handler: Arc<Mutex<Handler>>,
}

impl Registration {
    fn wants(&self, notification: &Notification) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(notification))
    }
}

#[derive(Default)]
pub struct RegistryRef {
    next_token: AtomicU64,
    registrations: DashMap<SubscriptionToken, Registration>,
}

#[derive(Clone, Default)]
pub struct Registry(Arc<RegistryRef>);

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events matching any of `filters`, or every
    /// event when `filters` is empty. The registration ends with `scope`.
    pub fn register<F>(
        &self,
        filters: impl IntoIterator<Item = Filter>,
        scope: &Scope,
        handler: F,
    ) -> SubscriptionToken
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        let token = SubscriptionToken(self.0.next_token.fetch_add(1, Ordering::Relaxed));
        let registration = Registration {
            filters: filters.into_iter().collect(),
            scope: scope.clone(),
            handler: Arc::new(Mutex::new(Box::new(handler))),
        };
        trace!(?token, filters = registration.filters.len(), "Registered subscription");
        self.0.registrations.insert(token, registration);
        token
    }

    /// Returns whether the registration was still present.
    pub fn unregister(&self, token: SubscriptionToken) -> bool {
        self.0.registrations.remove(&token).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.registrations.is_empty()
    }

    /// Invokes every live matching handler in registration order and returns
    /// how many ran. A handler that panics is logged and skipped.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        self.0.registrations.retain(|token, registration| {
            let live = !registration.scope.is_cancelled();
            if !live {
                trace!(?token, "Reaped subscription of an ended scope");
            }
            live
        });

        let mut targets = self
            .0
            .registrations
            .iter()
            .filter(|r| r.wants(notification))
            .map(|r| (*r.key(), r.scope.clone(), Arc::clone(&r.handler)))
            .collect::<Vec<_>>();
        targets.sort_unstable_by_key(|(token, ..)| *token);

        let mut delivered = 0;
        for (token, scope, handler) in targets {
            // an earlier handler may have ended this one's scope
            if scope.is_cancelled() || !self.0.registrations.contains_key(&token) {
                continue;
            }
            let mut handler = handler.lock().unwrap_or_else(PoisonError::into_inner);
            if panic::catch_unwind(AssertUnwindSafe(|| (*handler)(notification))).is_err() {
                error!(?token, event = notification.event, "Subscription handler panicked");
            }
            delivered += 1;
        }
        delivered
    }
}

/// The single delivery context. Whoever owns the dispatcher decides which
/// thread handlers run on: drive it with [`Dispatcher::run`] on one task, or
/// pump it from an existing loop with [`Dispatcher::dispatch_pending`].
pub struct Dispatcher {
    changes: ChangeStream,
    registry: Registry,
}

impl Dispatcher {
    pub fn new(changes: ChangeStream, registry: Registry) -> Self {
        Self { changes, registry }
    }

    /// Delivers changes until the cache is dropped.
    pub async fn run(&mut self) {
        while let Some(notification) = self.changes.recv().await {
            self.registry.dispatch(&notification);
        }
        trace!("Change stream closed");
    }

    /// Delivers whatever is queued without waiting and returns how many
    /// notifications were processed.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(notification) = self.changes.try_recv() {
            self.registry.dispatch(&notification);
            processed += 1;
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::{Filter, Registry};
    use crate::{change::Notification, scope::Scope};
    use cordstate_models::event::{EntityKind, Op};
    use std::sync::{Arc, Mutex};

    fn notification(op: Op, kind: EntityKind) -> Notification {
        Notification {
            op,
            kind,
            event: "Test",
            changes: Vec::new(),
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let registry = Registry::new();
        let scope = Scope::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = Arc::clone(&seen);
            registry.register([], &scope, move |_| seen.lock().unwrap().push(n));
        }
        registry.dispatch(&notification(Op::Create, EntityKind::Guild));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let registry = Registry::new();
        let scope = Scope::new();
        let hits = Arc::new(Mutex::new(0));
        registry.register([], &scope, |_| panic!("boom"));
        let counter = Arc::clone(&hits);
        registry.register([], &scope, move |_| *counter.lock().unwrap() += 1);

        let delivered = registry.dispatch(&notification(Op::Delete, EntityKind::User));
        assert_eq!(delivered, 2);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn cancelled_scopes_are_reaped() {
        let registry = Registry::new();
        let scope = Scope::new();
        registry.register(
            [Filter::new(Op::Update, EntityKind::Member)],
            &scope.child(),
            |_| {},
        );
        let token = registry.register([], &scope, |_| {});
        assert_eq!(registry.len(), 2);

        scope.cancel();
        let delivered = registry.dispatch(&notification(Op::Create, EntityKind::Guild));
        assert_eq!(delivered, 0);
        assert!(registry.is_empty());
        assert!(!registry.unregister(token));
    }

    #[test]
    fn filters_match_operation_and_kind_exactly() {
        let registry = Registry::new();
        let scope = Scope::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        registry.register(
            [Filter::new(Op::Update, EntityKind::Member)],
            &scope,
            move |_| *counter.lock().unwrap() += 1,
        );

        assert_eq!(registry.dispatch(&notification(Op::Delete, EntityKind::Channel)), 0);
        assert_eq!(registry.dispatch(&notification(Op::Create, EntityKind::Member)), 0);
        assert_eq!(registry.dispatch(&notification(Op::Update, EntityKind::Member)), 1);
        assert_eq!(registry.dispatch(&notification(Op::Update, EntityKind::Member)), 1);
        assert_eq!(*hits.lock().unwrap(), 2);
    }
}
