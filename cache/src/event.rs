use cordstate_models::{
    channel::Channel,
    event::{
        ChannelCreate, ChannelDelete, ChannelUpdate, Event, GuildCreate, GuildDelete, GuildUpdate,
        MemberAdd, MemberChunk, MemberRemove, MemberUpdate, MessageCreate, MessageDelete,
        MessageUpdate, Ready, RoleCreate, RoleDelete, RoleUpdate, UserUpdate,
    },
    field::Field,
    guild::Guild,
    id::GuildId,
    member::Member,
    message::Message,
    stats::CacheStats,
    user::User,
};
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, trace, warn};

use crate::{
    change::Notification,
    config::CacheConfig,
    error::{CacheError, ErrorKind},
    pending::PendingEvents,
    Cache, CachedChannel, CachedGuild, CachedMember, CachedRole, Writes,
};

pub(crate) trait UpdateCache {
    fn update(self, merger: &Merger, writes: &mut Writes<'_>) -> Result<(), CacheError>;
}

pub struct MergerRef {
    cache: Cache,
    pending: PendingEvents,
    /// Guilds the session has left. Events for them are stale and dropped.
    departed: DashSet<GuildId>,
    /// Events scoped to a guild share its lock, guild creates, updates and
    /// deletes take it alone.
    guards: DashMap<GuildId, Arc<RwLock<()>>>,
    stats: Arc<CacheStats>,
}

/// The only writer of the [`Cache`]. Every gateway event and every fetch
/// result goes through [`Merger::apply`].
#[derive(Clone)]
pub struct Merger(Arc<MergerRef>);

impl Merger {
    pub fn new(cache: Cache, config: &CacheConfig, stats: Arc<CacheStats>) -> Self {
        Self(Arc::new(MergerRef {
            cache,
            pending: PendingEvents::new(config.pending_depth, config.pending_ttl),
            departed: DashSet::new(),
            guards: DashMap::new(),
            stats,
        }))
    }

    pub fn cache(&self) -> &Cache {
        &self.0.cache
    }

    /// Events held back for a guild that has not been synced yet.
    pub fn pending(&self, guild_id: GuildId) -> usize {
        self.0.pending.len(guild_id)
    }

    pub fn has_departed(&self, guild_id: GuildId) -> bool {
        self.0.departed.contains(&guild_id)
    }

    /// Decode and apply one raw dispatch.
    pub fn apply_raw(&self, bytes: &[u8]) -> Result<(), CacheError> {
        match Event::from_json(bytes) {
            Ok(event) => self.apply(event),
            Err(err) => {
                self.0.stats.event_counts.malformed.inc();
                Err(err.into())
            }
        }
    }

    /// Apply one event. Events that need a guild which isn't cached are
    /// dropped if the guild was left and held back otherwise.
    pub fn apply(&self, event: Event) -> Result<(), CacheError> {
        self.0.stats.update(&event);
        let result = self.route(event);
        if let Err(err) = &result {
            if matches!(err.kind(), ErrorKind::MalformedPayload(_)) {
                self.0.stats.event_counts.malformed.inc();
            }
        }
        result
    }

    /// Consume a stream of events in order until it ends.
    pub async fn run<S>(&self, mut events: S)
    where
        S: Stream<Item = Event> + Unpin,
    {
        while let Some(event) = events.next().await {
            let name = event.name();
            if let Err(err) = self.apply(event) {
                warn!(event = name, error = %err, "Dropped event");
            }
        }
        info!("Event stream ended");
    }

    fn route(&self, event: Event) -> Result<(), CacheError> {
        let Some((guild_id, exclusive)) = guild_target(&event) else {
            return self.commit(event);
        };
        let created = matches!(event, Event::GuildCreate(_));
        let guard = self.guard(guild_id);

        let result = if exclusive {
            let _lock = guard.write().unwrap_or_else(PoisonError::into_inner);
            self.commit_in_guild(guild_id, event)
        } else {
            let _lock = guard.read().unwrap_or_else(PoisonError::into_inner);
            self.commit_in_guild(guild_id, event)
        };

        if created {
            self.replay(guild_id);
        }
        result
    }

    /// Runs with the guild's lock held, so the guild can't arrive or leave
    /// between the check and the write or hold.
    fn commit_in_guild(&self, guild_id: GuildId, event: Event) -> Result<(), CacheError> {
        let needs_guild = !matches!(event, Event::GuildCreate(_) | Event::GuildDelete(_));
        if needs_guild && self.0.cache.guild(guild_id).is_none() {
            if self.has_departed(guild_id) {
                debug!(guild = ?guild_id, event = event.name(), "Dropping event for a departed guild");
                self.0.stats.pending_counts.discarded.inc();
            } else {
                self.0
                    .pending
                    .push(guild_id, event, &self.0.stats.pending_counts);
            }
            return Ok(());
        }
        self.commit(event)
    }

    /// Applies `event` and publishes its notification if it wrote anything or
    /// went through cleanly.
    fn commit(&self, event: Event) -> Result<(), CacheError> {
        let (op, kind, name) = (event.op(), event.kind(), event.name());
        let mut writes = Writes::new(&self.0.cache);
        let result = event.update(self, &mut writes);
        let changes = writes.into_changes();
        if result.is_ok() || !changes.is_empty() {
            self.0.cache.publish(Notification {
                op,
                kind,
                event: name,
                changes,
            });
        }
        result
    }

    fn guard(&self, guild_id: GuildId) -> Arc<RwLock<()>> {
        Arc::clone(&self.0.guards.entry(guild_id).or_default())
    }

    fn replay(&self, guild_id: GuildId) {
        let events = self.0.pending.take(guild_id, &self.0.stats.pending_counts);
        if events.is_empty() {
            return;
        }
        debug!(guild = ?guild_id, count = events.len(), "Replaying held events");
        for event in events {
            self.0.stats.pending_counts.replayed.inc();
            let name = event.name();
            if let Err(err) = self.route(event) {
                warn!(guild = ?guild_id, event = name, error = %err, "Dropped held event");
            }
        }
    }
}

/// The guild an event is applied under, and whether it rewrites the guild
/// itself.
fn guild_target(event: &Event) -> Option<(GuildId, bool)> {
    match event {
        Event::GuildCreate(v) => Some((v.id, true)),
        Event::GuildUpdate(v) => Some((v.id, true)),
        Event::GuildDelete(v) => Some((v.id, true)),
        _ => event.guild_id().map(|guild_id| (guild_id, false)),
    }
}

impl UpdateCache for Event {
    fn update(self, m: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        use Event::{
            ChannelCreate, ChannelDelete, ChannelUpdate, GuildCreate, GuildDelete, GuildUpdate,
            MemberAdd, MemberChunk, MemberRemove, MemberUpdate, MessageCreate, MessageDelete,
            MessageUpdate, Ready, RoleCreate, RoleDelete, RoleUpdate, UserUpdate,
        };

        match self {
            Ready(v) => v.update(m, w),
            GuildCreate(v) => v.update(m, w),
            GuildUpdate(v) => v.update(m, w),
            GuildDelete(v) => v.update(m, w),
            ChannelCreate(v) => v.update(m, w),
            ChannelUpdate(v) => v.update(m, w),
            ChannelDelete(v) => v.update(m, w),
            RoleCreate(v) => v.update(m, w),
            RoleUpdate(v) => v.update(m, w),
            RoleDelete(v) => v.update(m, w),
            MemberAdd(v) => v.update(m, w),
            MemberUpdate(v) => v.update(m, w),
            MemberRemove(v) => v.update(m, w),
            MemberChunk(v) => v.update(m, w),
            MessageCreate(v) => v.update(m, w),
            MessageUpdate(v) => v.update(m, w),
            MessageDelete(v) => v.update(m, w),
            UserUpdate(v) => v.update(m, w),
        }
    }
}

impl<T: UpdateCache> UpdateCache for Box<T> {
    fn update(self, m: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        (*self).update(m, w)
    }
}

/// Guild channels must name their guild and direct-message channels must not.
fn validate_channel(channel: &Channel) -> Result<(), CacheError> {
    match (channel.is_private(), channel.guild_id) {
        (Some(true), Some(guild_id)) => Err(CacheError::malformed(format!(
            "direct-message channel {} claims guild {guild_id}",
            channel.id
        ))),
        (Some(false), None) => Err(CacheError::malformed(format!(
            "guild channel {} without a guild id",
            channel.id
        ))),
        _ => Ok(()),
    }
}

fn cache_member(w: &mut Writes<'_>, guild_id: GuildId, member: Member) -> Result<(), CacheError> {
    w.upsert(member.user.clone())?;
    w.upsert(CachedMember::new(guild_id, member))?;
    Ok(())
}

fn merge_member(w: &mut Writes<'_>, guild_id: GuildId, member: Member) -> Result<(), CacheError> {
    w.merge(member.user.clone())?;
    w.merge(CachedMember::new(guild_id, member))?;
    Ok(())
}

/// Brings the guild's roles and channels in line with the lists a guild
/// payload carries. Lists the payload omits are left alone. A bad item is
/// logged and skipped so the rest of the guild still syncs.
fn reconcile_guild(w: &mut Writes<'_>, guild: Guild) {
    let guild_id = guild.id;

    if let Field::Value(roles) = guild.roles {
        let mut stale = w.roles(guild_id);
        for role in roles {
            stale.remove(&role.id);
            let role_id = role.id;
            if let Err(err) = w.upsert(CachedRole::new(guild_id, role)) {
                warn!(guild = ?guild_id, role = ?role_id, error = %err, "Skipping role");
            }
        }
        for role_id in stale {
            w.delete::<CachedRole>(role_id);
        }
    }

    if let Field::Value(channels) = guild.channels {
        let mut stale = w.guild_channels(guild_id);
        for mut channel in channels {
            stale.remove(&channel.id);
            channel.guild_id = Some(guild_id);
            let channel_id = channel.id;
            let written = validate_channel(&channel)
                .and_then(|()| w.upsert(CachedChannel::from(channel)).map(drop));
            if let Err(err) = written {
                warn!(guild = ?guild_id, channel = ?channel_id, error = %err, "Skipping channel");
            }
        }
        for channel_id in stale {
            w.delete_channel(channel_id);
        }
    }

    if let Field::Value(members) = guild.members {
        for member in members {
            let user_id = member.user.id;
            if let Err(err) = cache_member(w, guild_id, member) {
                warn!(guild = ?guild_id, user = ?user_id, error = %err, "Skipping member");
            }
        }
    }
}

impl UpdateCache for Ready {
    fn update(self, m: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        info!(user = ?self.user.id, guilds = self.guilds.len(), "Session ready");
        w.cache_current_user(self.user.clone());
        w.upsert(self.user)?;
        for guild_id in self.guilds {
            m.0.departed.remove(&guild_id);
        }
        for channel in self.private_channels {
            let channel_id = channel.id;
            let written = validate_channel(&channel)
                .and_then(|()| w.upsert(CachedChannel::from(channel)).map(drop));
            if let Err(err) = written {
                warn!(channel = ?channel_id, error = %err, "Skipping private channel");
            }
        }
        Ok(())
    }
}

impl UpdateCache for GuildCreate {
    fn update(self, m: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        m.0.departed.remove(&self.id);
        w.upsert(CachedGuild::from(&self.0))?;
        reconcile_guild(w, self.0);
        Ok(())
    }
}

impl UpdateCache for GuildUpdate {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        w.merge(CachedGuild::from(&self.0))?;
        reconcile_guild(w, self.0);
        Ok(())
    }
}

impl UpdateCache for GuildDelete {
    fn update(self, m: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        w.delete_guild(self.id);
        if self.unavailable {
            debug!(guild = ?self.id, "Guild became unavailable");
        } else {
            info!(guild = ?self.id, "Left guild");
            m.0.departed.insert(self.id);
            m.0.pending.discard(self.id, &m.0.stats.pending_counts);
        }
        Ok(())
    }
}

impl UpdateCache for ChannelCreate {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        validate_channel(&self)?;
        w.upsert(CachedChannel::from(self.0))?;
        Ok(())
    }
}

impl UpdateCache for ChannelUpdate {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        validate_channel(&self)?;
        w.merge(CachedChannel::from(self.0))?;
        Ok(())
    }
}

impl UpdateCache for ChannelDelete {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        w.delete_channel(self.id);
        Ok(())
    }
}

impl UpdateCache for RoleCreate {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        w.upsert(CachedRole::new(self.guild_id, self.role))?;
        Ok(())
    }
}

impl UpdateCache for RoleUpdate {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        w.merge(CachedRole::new(self.guild_id, self.role))?;
        Ok(())
    }
}

impl UpdateCache for RoleDelete {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        if w.role(self.role_id).is_some_and(|role| role.guild_id != self.guild_id) {
            return Err(CacheError::malformed(format!(
                "role {} does not belong to guild {}",
                self.role_id, self.guild_id
            )));
        }
        w.delete::<CachedRole>(self.role_id);
        Ok(())
    }
}

impl UpdateCache for MemberAdd {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        cache_member(w, self.guild_id, self.member)
    }
}

impl UpdateCache for MemberUpdate {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        merge_member(w, self.guild_id, self.member)
    }
}

impl UpdateCache for MemberRemove {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        w.delete::<CachedMember>((self.guild_id, self.user_id));
        Ok(())
    }
}

impl UpdateCache for MemberChunk {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        trace!(guild = ?self.guild_id, members = self.members.len(), not_found = self.not_found.len(), "Member chunk");
        for member in self.members {
            merge_member(w, self.guild_id, member)?;
        }
        Ok(())
    }
}

impl UpdateCache for MessageCreate {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        let message = self.message;
        if let Field::Value(author) = &message.author {
            w.upsert(author.clone())?;
            if let (Some(guild_id), Some(member)) = (message.guild_id, self.member) {
                w.upsert(CachedMember::new(guild_id, member.with_user(author.clone())))?;
            }
        }
        w.upsert(message)?;
        Ok(())
    }
}

impl UpdateCache for MessageUpdate {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        if let Field::Value(author) = &self.author {
            w.merge(author.clone())?;
        }
        w.merge(self.0)?;
        Ok(())
    }
}

impl UpdateCache for MessageDelete {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        w.delete::<Message>(self.id);
        Ok(())
    }
}

impl UpdateCache for UserUpdate {
    fn update(self, _: &Merger, w: &mut Writes<'_>) -> Result<(), CacheError> {
        if w.current_user().is_some_and(|user| user.id == self.id) {
            w.cache_current_user(self.0.clone());
        }
        w.merge::<User>(self.0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Merger;
    use crate::{change, config::CacheConfig, error::ErrorKind, Cache};
    use cordstate_models::{event::Event, id::Id, stats::CacheStats};
    use std::{sync::Arc, time::Duration};

    fn merger(config: &CacheConfig) -> (Merger, change::ChangeStream) {
        let (sink, stream) = change::channel();
        let stats = Arc::new(CacheStats::new().unwrap());
        let cache = Cache::new(config.message_limit, Arc::clone(&stats), sink);
        (Merger::new(cache, config, stats), stream)
    }

    fn apply(m: &Merger, raw: &str) {
        m.apply_raw(raw.as_bytes()).unwrap();
    }

    const GUILD: &str = r#"{"t":"GUILD_CREATE","d":{"id":"1","name":"g","owner_id":"9",
        "roles":[{"id":"1","name":"@everyone","permissions":"0","position":0},
                 {"id":"2","name":"mods","color":255,"permissions":"8","position":1}],
        "channels":[{"id":"3","type":0,"name":"general"}]}}"#;

    #[test]
    fn guild_create_reconciles_roles_and_channels() {
        let (m, _changes) = merger(&CacheConfig::default());
        apply(&m, GUILD);
        assert_eq!(m.cache().roles(Id::new(1)).len(), 2);
        assert_eq!(m.cache().channel(Id::new(3)).unwrap().guild_id, Some(Id::new(1)));

        apply(
            &m,
            r#"{"t":"GUILD_UPDATE","d":{"id":"1","roles":[{"id":"1","permissions":"0"}],"channels":[]}}"#,
        );
        assert!(m.cache().role(Id::new(2)).is_none());
        assert!(m.cache().channel(Id::new(3)).is_none());
        assert_eq!(m.cache().guild(Id::new(1)).unwrap().name.value().unwrap(), "g");
    }

    #[tokio::test(start_paused = true)]
    async fn early_events_replay_after_guild_create() {
        let (m, _changes) = merger(&CacheConfig::default());
        apply(
            &m,
            r#"{"t":"MEMBER_ADD","d":{"guild_id":"1","member":{"user":{"id":"5","username":"u"},"nick":"A","roles":[]}}}"#,
        );
        assert!(m.cache().member(Id::new(1), Id::new(5)).is_none());
        assert_eq!(m.pending(Id::new(1)), 1);

        apply(&m, GUILD);
        assert_eq!(m.pending(Id::new(1)), 0);
        let member = m.cache().member(Id::new(1), Id::new(5)).unwrap();
        assert_eq!(member.nick.value().unwrap(), "A");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_and_overflowed_events_are_dropped() {
        let config = CacheConfig {
            pending_depth: 1,
            pending_ttl: Duration::from_secs(1),
            ..CacheConfig::default()
        };
        let (m, _changes) = merger(&config);
        let add = |user: u64| {
            format!(r#"{{"t":"MEMBER_ADD","d":{{"guild_id":"1","member":{{"user":{{"id":"{user}"}}}}}}}}"#)
        };
        apply(&m, &add(5));
        apply(&m, &add(6));
        assert_eq!(m.pending(Id::new(1)), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        apply(&m, GUILD);
        assert!(m.cache().member(Id::new(1), Id::new(5)).is_none());
        assert!(m.cache().member(Id::new(1), Id::new(6)).is_none());
    }

    #[test]
    fn events_for_left_guilds_are_dropped() {
        let (m, _changes) = merger(&CacheConfig::default());
        apply(&m, GUILD);
        apply(&m, r#"{"t":"GUILD_DELETE","d":{"id":"1"}}"#);
        assert!(m.has_departed(Id::new(1)));
        assert!(m.cache().role(Id::new(2)).is_none());

        apply(&m, r#"{"t":"ROLE_CREATE","d":{"guild_id":"1","role":{"id":"7"}}}"#);
        assert_eq!(m.pending(Id::new(1)), 0);
        assert!(m.cache().role(Id::new(7)).is_none());
    }

    #[test]
    fn late_guild_update_does_not_revive_a_left_guild() {
        let (m, _changes) = merger(&CacheConfig::default());
        apply(&m, GUILD);
        apply(&m, r#"{"t":"GUILD_DELETE","d":{"id":"1"}}"#);
        apply(&m, r#"{"t":"GUILD_UPDATE","d":{"id":"1","name":"late"}}"#);
        apply(
            &m,
            r#"{"t":"MEMBER_ADD","d":{"guild_id":"1","member":{"user":{"id":"5"}}}}"#,
        );

        assert!(m.cache().guild(Id::new(1)).is_none());
        assert!(m.cache().member(Id::new(1), Id::new(5)).is_none());
        assert_eq!(m.pending(Id::new(1)), 0);
    }

    #[test]
    fn guild_update_before_create_is_held() {
        let (m, _changes) = merger(&CacheConfig::default());
        apply(&m, r#"{"t":"GUILD_UPDATE","d":{"id":"1","name":"renamed"}}"#);
        assert!(m.cache().guild(Id::new(1)).is_none());
        assert_eq!(m.pending(Id::new(1)), 1);

        apply(&m, GUILD);
        let guild = m.cache().guild(Id::new(1)).unwrap();
        assert_eq!(guild.name.value().unwrap(), "renamed");
        assert_eq!(m.cache().roles(Id::new(1)).len(), 2);
    }

    #[test]
    fn bad_channel_does_not_cut_the_guild_sync_short() {
        let (m, _changes) = merger(&CacheConfig::default());
        apply(
            &m,
            r#"{"t":"GUILD_CREATE","d":{"id":"1","name":"g",
                "channels":[{"id":"3","type":1},{"id":"4","type":0}],
                "members":[{"user":{"id":"5"},"nick":"A"}]}}"#,
        );

        assert!(m.cache().channel(Id::new(3)).is_none());
        assert_eq!(m.cache().channel(Id::new(4)).unwrap().guild_id, Some(Id::new(1)));
        assert!(m.cache().member(Id::new(1), Id::new(5)).is_some());
    }

    #[test]
    fn malformed_channels_are_rejected() {
        let (m, _changes) = merger(&CacheConfig::default());
        let err = m
            .apply_raw(br#"{"t":"CHANNEL_CREATE","d":{"id":"3","type":0}}"#)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MalformedPayload(_)));
        assert!(m.apply_raw(b"not json").is_err());
        assert!(m.cache().channel(Id::new(3)).is_none());
    }

    #[test]
    fn message_create_caches_author_and_member() {
        let (m, _changes) = merger(&CacheConfig::default());
        apply(&m, GUILD);
        apply(
            &m,
            r#"{"t":"MESSAGE_CREATE","d":{"message":{"id":"10","channel_id":"3","guild_id":"1",
                "author":{"id":"5","username":"u"},"content":"hi"},"member":{"nick":"N","roles":["2"]}}}"#,
        );
        assert_eq!(m.cache().user(Id::new(5)).unwrap().username.value().unwrap(), "u");
        let member = m.cache().member(Id::new(1), Id::new(5)).unwrap();
        assert_eq!(member.nick.value().unwrap(), "N");
        assert_eq!(m.cache().channel_messages(Id::new(3)).len(), 1);
        assert_eq!(m.cache().member_color(Id::new(1), Id::new(5)), Some(255));
    }

    #[test]
    fn user_update_refreshes_current_user() {
        let (m, _changes) = merger(&CacheConfig::default());
        apply(&m, r#"{"t":"READY","d":{"user":{"id":"4","username":"me"}}}"#);
        apply(&m, r#"{"t":"USER_UPDATE","d":{"id":"4","username":"renamed"}}"#);
        let me = m.cache().current_user().unwrap();
        assert_eq!(me.username.value().unwrap(), "renamed");
    }
}
