use async_trait::async_trait;
use cordstate_models::{
    channel::Channel,
    event::{ChannelUpdate, Event, MemberChunk, UserUpdate},
    id::{ChannelId, GuildId, UserId},
    member::Member,
    stats::CacheStats,
    user::User,
};
use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use std::{
    collections::{HashMap, HashSet},
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
    future::Future,
    sync::Arc,
    time::Duration,
};
use tokio::runtime::Handle;
use tokio_retry2::{strategy::ExponentialBackoff, Retry, RetryError};
use tracing::{debug, trace, warn};

use crate::{config::CacheConfig, scope::Scope, CachedChannel, CachedMember, Merger};

/// A failed lookup against the remote side.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FetchError {
    NotFound,
    RateLimited { retry_after: Duration },
    Transport(String),
    /// Every scope that asked for the entity ended, or the fetcher shut down.
    Cancelled,
}

impl FetchError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transport(_))
    }
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::NotFound => f.write_str("entity not found"),
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {}ms", retry_after.as_millis())
            }
            Self::Transport(reason) => write!(f, "transport error: {reason}"),
            Self::Cancelled => f.write_str("fetch cancelled"),
        }
    }
}

impl StdError for FetchError {}

/// The network side of on-demand lookups.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Members of one guild. Ids unknown to the remote side are left out of
    /// the result.
    async fn members(&self, guild_id: GuildId, user_ids: Vec<UserId>)
        -> Result<Vec<Member>, FetchError>;

    async fn user(&self, user_id: UserId) -> Result<User, FetchError>;

    async fn channel(&self, channel_id: ChannelId) -> Result<Channel, FetchError>;
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
enum FetchKey {
    Member(GuildId, UserId),
    User(UserId),
    Channel(ChannelId),
}

/// Lookups that go out one id at a time. Members are always batched.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
enum Single {
    User(UserId),
    Channel(ChannelId),
}

impl From<Single> for FetchKey {
    fn from(single: Single) -> Self {
        match single {
            Single::User(user_id) => Self::User(user_id),
            Single::Channel(channel_id) => Self::Channel(channel_id),
        }
    }
}

pub struct FetcherRef {
    merger: Merger,
    source: Arc<dyn Fetch>,
    runtime: Handle,
    /// Member misses per guild waiting for their batch window to close,
    /// with the scopes that asked for each.
    batches: DashMap<GuildId, HashMap<UserId, Vec<Scope>>>,
    /// Single-id lookups in progress, with the scopes that asked.
    singles: DashMap<Single, Vec<Scope>>,
    in_flight: DashSet<FetchKey>,
    failed: DashSet<FetchKey>,
    shutdown: Scope,
    config: CacheConfig,
    stats: Arc<CacheStats>,
}

/// Turns cache misses into background lookups whose results are fed back
/// through the [`Merger`]. None of the `ensure_*` calls block.
#[derive(Clone)]
pub struct Fetcher(Arc<FetcherRef>);

impl Fetcher {
    pub fn new(
        merger: Merger,
        source: Arc<dyn Fetch>,
        runtime: Handle,
        config: CacheConfig,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self(Arc::new(FetcherRef {
            merger,
            source,
            runtime,
            batches: DashMap::new(),
            singles: DashMap::new(),
            in_flight: DashSet::new(),
            failed: DashSet::new(),
            shutdown: Scope::new(),
            config,
            stats,
        }))
    }

    /// Returns the cached member, stub or not. On a miss the member is added
    /// to the guild's next batched lookup and `None` is returned.
    pub fn ensure_member(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        scope: &Scope,
    ) -> Option<Arc<CachedMember>> {
        let key = FetchKey::Member(guild_id, user_id);
        if let Some(member) = self.0.merger.cache().member(guild_id, user_id) {
            if !member.is_stub() {
                self.0.failed.remove(&key);
            } else if self.0.config.refine_stubs && !self.0.failed.contains(&key) {
                self.queue_member(guild_id, user_id, scope);
            }
            return Some(member);
        }
        if !self.0.failed.contains(&key) {
            self.queue_member(guild_id, user_id, scope);
        }
        None
    }

    /// Forget an earlier failed lookup and try again.
    pub fn refetch_member(&self, guild_id: GuildId, user_id: UserId, scope: &Scope) {
        self.0.failed.remove(&FetchKey::Member(guild_id, user_id));
        self.queue_member(guild_id, user_id, scope);
    }

    pub fn ensure_user(&self, user_id: UserId, scope: &Scope) -> Option<Arc<User>> {
        let key = FetchKey::User(user_id);
        if let Some(user) = self.0.merger.cache().user(user_id) {
            if !user.is_stub() {
                self.0.failed.remove(&key);
            } else if self.0.config.refine_stubs && !self.0.failed.contains(&key) {
                self.queue_single(Single::User(user_id), scope);
            }
            return Some(user);
        }
        if !self.0.failed.contains(&key) {
            self.queue_single(Single::User(user_id), scope);
        }
        None
    }

    pub fn ensure_channel(&self, channel_id: ChannelId, scope: &Scope) -> Option<Arc<CachedChannel>> {
        let key = FetchKey::Channel(channel_id);
        if let Some(channel) = self.0.merger.cache().channel(channel_id) {
            self.0.failed.remove(&key);
            return Some(channel);
        }
        if !self.0.failed.contains(&key) {
            self.queue_single(Single::Channel(channel_id), scope);
        }
        None
    }

    /// Cancels every pending and in-flight lookup. Later misses are ignored.
    pub fn shutdown(&self) {
        self.0.shutdown.cancel();
        self.0.batches.clear();
        self.0.singles.clear();
    }

    pub fn is_failed_member(&self, guild_id: GuildId, user_id: UserId) -> bool {
        self.0.failed.contains(&FetchKey::Member(guild_id, user_id))
    }

    fn queue_member(&self, guild_id: GuildId, user_id: UserId, scope: &Scope) {
        if self.0.shutdown.is_cancelled() || scope.is_cancelled() {
            return;
        }
        if self.0.in_flight.contains(&FetchKey::Member(guild_id, user_id)) {
            return;
        }

        let opened = match self.0.batches.entry(guild_id) {
            Entry::Occupied(mut e) => {
                e.get_mut().entry(user_id).or_default().push(scope.clone());
                false
            }
            Entry::Vacant(e) => {
                e.insert(HashMap::from([(user_id, vec![scope.clone()])]));
                true
            }
        };

        if opened {
            trace!(guild = ?guild_id, "Opened member batch");
            let fetcher = self.clone();
            self.0
                .runtime
                .spawn(async move { fetcher.flush_members(guild_id).await });
        }
    }

    fn queue_single(&self, key: Single, scope: &Scope) {
        if self.0.shutdown.is_cancelled() || scope.is_cancelled() {
            return;
        }
        match self.0.singles.entry(key) {
            Entry::Occupied(mut e) => e.get_mut().push(scope.clone()),
            Entry::Vacant(e) => {
                e.insert(vec![scope.clone()]);
                let fetcher = self.clone();
                self.0
                    .runtime
                    .spawn(async move { fetcher.fetch_single(key).await });
            }
        }
    }

    /// Users of a batch that at least one live scope still wants, in id order.
    fn live_users(batch: &HashMap<UserId, Vec<Scope>>) -> Vec<UserId> {
        let mut users = batch
            .iter()
            .filter(|(_, scopes)| scopes.iter().any(|s| !s.is_cancelled()))
            .map(|(user_id, _)| *user_id)
            .collect::<Vec<_>>();
        users.sort_unstable();
        users
    }

    fn single_is_live(&self, key: Single) -> bool {
        self.0
            .singles
            .get(&key)
            .is_some_and(|scopes| scopes.iter().any(|s| !s.is_cancelled()))
    }

    async fn flush_members(self, guild_id: GuildId) {
        tokio::select! {
            () = self.0.shutdown.cancelled() => {
                self.0.batches.remove(&guild_id);
                return;
            }
            () = tokio::time::sleep(self.0.config.batch_window) => {}
        }

        let Some((_, batch)) = self.0.batches.remove(&guild_id) else {
            return;
        };
        for user_id in batch.keys() {
            self.0.in_flight.insert(FetchKey::Member(guild_id, *user_id));
        }

        self.0.stats.fetch_counts.requested.inc();
        debug!(guild = ?guild_id, users = batch.len(), "Fetching members");
        let result = self
            .retrying(|| {
                let users = Self::live_users(&batch);
                let source = Arc::clone(&self.0.source);
                async move {
                    if users.is_empty() {
                        return Err(FetchError::Cancelled);
                    }
                    source.members(guild_id, users).await
                }
            })
            .await;

        let requested = Self::live_users(&batch);
        match result {
            Ok(members) => {
                self.0.stats.fetch_counts.succeeded.inc();
                let found = members.iter().map(|m| m.user.id).collect::<HashSet<_>>();
                let not_found = requested
                    .into_iter()
                    .filter(|user_id| !found.contains(user_id))
                    .collect::<Vec<_>>();
                for user_id in &not_found {
                    debug!(guild = ?guild_id, user = ?user_id, "Member not found");
                    self.0.failed.insert(FetchKey::Member(guild_id, *user_id));
                }
                let chunk = MemberChunk {
                    guild_id,
                    members,
                    not_found,
                };
                if let Err(err) = self.0.merger.apply(Event::MemberChunk(chunk)) {
                    warn!(guild = ?guild_id, error = %err, "Failed to apply fetched members");
                }
            }
            Err(FetchError::Cancelled) => {
                self.0.stats.fetch_counts.cancelled.inc();
                debug!(guild = ?guild_id, "Member fetch cancelled");
            }
            Err(err) => {
                self.0.stats.fetch_counts.failed.inc();
                warn!(guild = ?guild_id, users = requested.len(), error = %err, "Member fetch failed");
                for user_id in requested {
                    self.0.failed.insert(FetchKey::Member(guild_id, user_id));
                }
            }
        }

        for user_id in batch.keys() {
            self.0.in_flight.remove(&FetchKey::Member(guild_id, *user_id));
        }
    }

    async fn fetch_single(self, key: Single) {
        self.0.stats.fetch_counts.requested.inc();
        let result = self
            .retrying(|| {
                let live = self.single_is_live(key);
                let source = Arc::clone(&self.0.source);
                async move {
                    if !live {
                        return Err(FetchError::Cancelled);
                    }
                    match key {
                        Single::User(user_id) => source
                            .user(user_id)
                            .await
                            .map(|user| Event::UserUpdate(UserUpdate(user))),
                        Single::Channel(channel_id) => source
                            .channel(channel_id)
                            .await
                            .map(|channel| Event::ChannelUpdate(Box::new(ChannelUpdate(channel)))),
                    }
                }
            })
            .await;

        match result {
            Ok(event) => {
                self.0.stats.fetch_counts.succeeded.inc();
                if let Err(err) = self.0.merger.apply(event) {
                    warn!(?key, error = %err, "Failed to apply fetched entity");
                }
            }
            Err(FetchError::Cancelled) => {
                self.0.stats.fetch_counts.cancelled.inc();
                debug!(?key, "Fetch cancelled");
            }
            Err(err) => {
                self.0.stats.fetch_counts.failed.inc();
                warn!(?key, error = %err, "Fetch failed");
                self.0.failed.insert(key.into());
            }
        }
        self.0.singles.remove(&key);
    }

    /// Runs `operation` until it succeeds, fails permanently, or the retry
    /// budget runs out. Rate limits wait for as long as the remote side asks.
    async fn retrying<T, F, Fut>(&self, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        // 2^n * backoff / 2 yields backoff, 2 * backoff, 4 * backoff, ...
        let backoff = u64::try_from(self.0.config.fetch_backoff.as_millis()).unwrap_or(u64::MAX);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor((backoff / 2).max(1))
            .take(usize::try_from(self.0.config.fetch_retries).unwrap_or(usize::MAX));

        let attempts = Retry::spawn(strategy, || {
            let attempt = operation();
            async move {
                match attempt.await {
                    Ok(value) => Ok(value),
                    Err(FetchError::RateLimited { retry_after }) => {
                        debug!(retry_after = ?retry_after, "Rate limited, will retry");
                        Err(RetryError::Transient {
                            err: FetchError::RateLimited { retry_after },
                            retry_after: Some(retry_after),
                        })
                    }
                    Err(err) if err.is_retryable() => {
                        debug!(error = %err, "Transient fetch error, will retry");
                        Err(RetryError::Transient {
                            err,
                            retry_after: None,
                        })
                    }
                    Err(err) => Err(RetryError::Permanent(err)),
                }
            }
        });

        tokio::select! {
            () = self.0.shutdown.cancelled() => Err(FetchError::Cancelled),
            result = attempts => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Fetch, FetchError, Fetcher};
    use crate::{change, config::CacheConfig, scope::Scope, Cache, Merger};
    use async_trait::async_trait;
    use cordstate_models::{
        channel::Channel,
        field::Field,
        id::{ChannelId, GuildId, Id, UserId},
        member::Member,
        stats::CacheStats,
        user::User,
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct Remote {
        calls: Mutex<Vec<Vec<UserId>>>,
        transient_failures: AtomicUsize,
        missing: bool,
    }

    impl Remote {
        fn calls(&self) -> Vec<Vec<UserId>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetch for Remote {
        async fn members(
            &self,
            _guild_id: GuildId,
            user_ids: Vec<UserId>,
        ) -> Result<Vec<Member>, FetchError> {
            self.calls.lock().unwrap().push(user_ids.clone());
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FetchError::Transport("connection reset".into()));
            }
            if self.missing {
                return Ok(Vec::new());
            }
            Ok(user_ids
                .into_iter()
                .map(|id| Member {
                    user: User {
                        username: Field::Value(format!("user{id}")),
                        ..User::stub(id)
                    },
                    nick: Field::Value("B".into()),
                    roles: Field::Value(Vec::new()),
                    joined_at: Field::Null,
                })
                .collect())
        }

        async fn user(&self, _user_id: UserId) -> Result<User, FetchError> {
            Err(FetchError::NotFound)
        }

        async fn channel(&self, _channel_id: ChannelId) -> Result<Channel, FetchError> {
            Err(FetchError::NotFound)
        }
    }

    fn fetcher(remote: Arc<Remote>) -> Fetcher {
        let config = CacheConfig::default();
        let (sink, _) = change::channel();
        let stats = Arc::new(CacheStats::new().unwrap());
        let cache = Cache::new(config.message_limit, Arc::clone(&stats), sink);
        let merger = Merger::new(cache, &config, Arc::clone(&stats));
        merger
            .apply_raw(br#"{"t":"GUILD_CREATE","d":{"id":"1","name":"g"}}"#)
            .unwrap();
        Fetcher::new(merger, remote, Handle::current(), config, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn misses_in_one_window_share_a_request() {
        let remote = Arc::new(Remote::default());
        let fetcher = fetcher(Arc::clone(&remote));
        let scope = Scope::new();

        assert!(fetcher.ensure_member(Id::new(1), Id::new(5), &scope).is_none());
        assert!(fetcher.ensure_member(Id::new(1), Id::new(6), &scope).is_none());
        assert!(fetcher.ensure_member(Id::new(1), Id::new(5), &scope).is_none());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(remote.calls(), vec![vec![Id::new(5), Id::new(6)]]);
        let member = fetcher.ensure_member(Id::new(1), Id::new(5), &scope).unwrap();
        assert_eq!(member.nick.value().unwrap(), "B");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let remote = Arc::new(Remote {
            transient_failures: AtomicUsize::new(2),
            ..Remote::default()
        });
        let fetcher = fetcher(Arc::clone(&remote));
        let scope = Scope::new();

        fetcher.ensure_member(Id::new(1), Id::new(5), &scope);
        // window closes at 50ms, retries wait 250ms then 500ms
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(remote.calls().len(), 2);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(remote.calls().len(), 3);
        assert!(fetcher.ensure_member(Id::new(1), Id::new(5), &scope).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_sticks_until_refetched() {
        let remote = Arc::new(Remote {
            missing: true,
            ..Remote::default()
        });
        let fetcher = fetcher(Arc::clone(&remote));
        let scope = Scope::new();

        fetcher.ensure_member(Id::new(1), Id::new(5), &scope);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fetcher.is_failed_member(Id::new(1), Id::new(5)));

        assert!(fetcher.ensure_member(Id::new(1), Id::new(5), &scope).is_none());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(remote.calls().len(), 1);

        fetcher.refetch_member(Id::new(1), Id::new(5), &scope);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(remote.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_scopes_skip_the_request() {
        let remote = Arc::new(Remote::default());
        let fetcher = fetcher(Arc::clone(&remote));
        let scope = Scope::new();

        fetcher.ensure_member(Id::new(1), Id::new(5), &scope);
        scope.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(remote.calls().is_empty());
        assert!(!fetcher.is_failed_member(Id::new(1), Id::new(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn single_lookups_mark_not_found() {
        let remote = Arc::new(Remote::default());
        let fetcher = fetcher(remote);
        let scope = Scope::new();

        assert!(fetcher.ensure_user(Id::new(9), &scope).is_none());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fetcher.0.failed.contains(&super::FetchKey::User(Id::new(9))));
        assert!(fetcher.0.singles.is_empty());
    }
}
