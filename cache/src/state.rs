use cordstate_models::{message::Message, stats::CacheStats};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::trace;

use crate::{
    change::{self, Notification},
    config::CacheConfig,
    error::CacheError,
    fetch::{Fetch, Fetcher},
    scope::Scope,
    subscription::{Dispatcher, Filter, Registry, SubscriptionToken},
    Cache, Merger,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthorTag {
    Bot,
    Webhook,
}

/// How a message author should be shown.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthorDisplay {
    /// The guild nickname when known, the username otherwise.
    pub name: String,
    /// Colour of the author's highest coloured role.
    pub color: Option<u32>,
    pub tag: Option<AuthorTag>,
}

/// The cache with everything around it: the merger that writes it, the
/// fetcher that fills misses and the registry that hears about changes.
#[derive(Clone)]
pub struct State {
    cache: Cache,
    merger: Merger,
    fetcher: Fetcher,
    registry: Registry,
    stats: Arc<CacheStats>,
}

impl State {
    /// Fetches run on `runtime`. The returned [`Dispatcher`] has to be driven
    /// for subscriptions to hear anything.
    pub fn new(
        config: CacheConfig,
        source: Arc<dyn Fetch>,
        runtime: Handle,
    ) -> Result<(Self, Dispatcher), CacheError> {
        let stats = Arc::new(CacheStats::new()?);
        let (sink, changes) = change::channel();
        let cache = Cache::new(config.message_limit, Arc::clone(&stats), sink);
        let merger = Merger::new(cache.clone(), &config, Arc::clone(&stats));
        let fetcher = Fetcher::new(merger.clone(), source, runtime, config, Arc::clone(&stats));
        let registry = Registry::new();
        let dispatcher = Dispatcher::new(changes, registry.clone());

        Ok((
            Self {
                cache,
                merger,
                fetcher,
                registry,
                stats,
            },
            dispatcher,
        ))
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn merger(&self) -> &Merger {
        &self.merger
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub fn subscribe<F>(
        &self,
        filters: impl IntoIterator<Item = Filter>,
        scope: &Scope,
        handler: F,
    ) -> SubscriptionToken
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        self.registry.register(filters, scope, handler)
    }

    /// Name, colour and tag for a message's author. Guild members missing from
    /// the cache are requested in the background, and the message's own copy
    /// of the author is used meanwhile.
    pub fn author_display(&self, message: &Message, scope: &Scope) -> Option<AuthorDisplay> {
        let author = message.author.value()?;

        let tag = if message.webhook_id.is_some() {
            Some(AuthorTag::Webhook)
        } else if author.is_bot() {
            Some(AuthorTag::Bot)
        } else {
            None
        };

        let member = match message.guild_id {
            Some(guild_id) if message.webhook_id.is_none() => {
                let member = self.fetcher.ensure_member(guild_id, author.id, scope);
                if member.is_none() {
                    trace!(guild = ?guild_id, user = ?author.id, "Author not cached, requested");
                }
                member
            }
            _ => None,
        };

        let username = author
            .username
            .value()
            .cloned()
            .or_else(|| {
                self.cache
                    .user(author.id)
                    .and_then(|user| user.username.value().cloned())
            })
            .unwrap_or_else(|| author.id.to_string());
        let name = member
            .as_ref()
            .and_then(|m| m.nick.value().cloned())
            .unwrap_or(username);
        let color = member.and_then(|m| self.cache.member_color(m.guild_id, m.user_id));

        Some(AuthorDisplay { name, color, tag })
    }
}
