#![deny(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::implicit_hasher,
    clippy::missing_panics_doc
)]

pub mod change;
pub mod config;
pub mod error;
mod event;
pub mod fetch;
mod models;
mod pending;
pub mod scope;
pub mod state;
pub mod subscription;

use cordstate_models::{
    discord::{
        channel::permission_overwrite::PermissionOverwriteType,
        guild::Permissions,
        id::marker::{RoleMarker, UserMarker},
    },
    event::{EntityKind, Op},
    field::Merge,
    id::{ChannelId, GuildId, MessageId, RoleId, UserId},
    message::Message,
    stats::CacheStats,
    user::User,
};
use dashmap::{mapref::entry::Entry, DashMap};
use prometheus::IntGauge;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Debug,
    hash::Hash,
    ops::Deref,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{error, trace};

use change::{Change, ChangeSink, Entity, EntityKey, Notification};
use error::CacheError;

pub use event::Merger;
pub use fetch::Fetcher;
pub use scope::Scope;
pub use state::State;
pub use models::{
    channel::CachedChannel, guild::CachedGuild, member::CachedMember, role::CachedRole,
};

/// Add an element to the structure that maps the guild ids to the set of the resources they hold
fn upsert_guild_item<K: Eq + Hash, V: Eq + Hash>(map: &DashMap<K, HashSet<V>>, k: K, v: V) {
    match map.entry(k) {
        Entry::Occupied(e) if e.get().contains(&v) => {}
        Entry::Occupied(mut e) => {
            e.get_mut().insert(v);
        }
        Entry::Vacant(e) => {
            e.insert(HashSet::from([v]));
        }
    }
}

fn remove_guild_item<K: Eq + Hash, V: Eq + Hash>(map: &DashMap<K, HashSet<V>>, k: &K, v: &V) {
    if let Some(mut items) = map.get_mut(k) {
        items.remove(v);
    }
}

/// One cache partition. Each kind knows its bucket, its identity key and the
/// guild indexes it has to keep in step.
pub(crate) trait Cached: Clone + Merge + PartialEq + Send + Sync + 'static {
    type Key: Copy + Debug + Eq + Hash + Send + Sync;

    const KIND: EntityKind;
    /// Partial-profile kinds merge on upsert instead of being replaced.
    const MERGE_ON_UPSERT: bool = false;

    fn key(&self) -> Self::Key;

    fn entity_key(key: Self::Key) -> EntityKey;

    fn entity(value: Arc<Self>) -> Entity;

    fn bucket(cache: &CacheRef) -> &DashMap<Self::Key, Arc<Self>>;

    fn gauge(stats: &CacheStats) -> &IntGauge;

    /// Whether `newer` may be written over `self` without moving the entity
    /// to a different parent.
    fn same_parent(&self, _newer: &Self) -> bool {
        true
    }

    /// Fill in a parent reference the newer payload left out from `older`.
    fn keep_parent(&mut self, _older: &Self) {}

    fn index(&self, _cache: &Cache) {}

    fn unindex(&self, _cache: &Cache) {}
}

impl Cached for CachedGuild {
    type Key = GuildId;

    const KIND: EntityKind = EntityKind::Guild;

    fn key(&self) -> GuildId {
        self.id
    }

    fn entity_key(key: GuildId) -> EntityKey {
        EntityKey::Guild(key)
    }

    fn entity(value: Arc<Self>) -> Entity {
        Entity::Guild(value)
    }

    fn bucket(cache: &CacheRef) -> &DashMap<GuildId, Arc<Self>> {
        &cache.guilds
    }

    fn gauge(stats: &CacheStats) -> &IntGauge {
        &stats.resource_counts.guilds
    }
}

impl Cached for CachedChannel {
    type Key = ChannelId;

    const KIND: EntityKind = EntityKind::Channel;

    fn key(&self) -> ChannelId {
        self.id
    }

    fn entity_key(key: ChannelId) -> EntityKey {
        EntityKey::Channel(key)
    }

    fn entity(value: Arc<Self>) -> Entity {
        Entity::Channel(value)
    }

    fn bucket(cache: &CacheRef) -> &DashMap<ChannelId, Arc<Self>> {
        &cache.channels
    }

    fn gauge(stats: &CacheStats) -> &IntGauge {
        &stats.resource_counts.channels
    }

    fn same_parent(&self, newer: &Self) -> bool {
        match (self.guild_id, newer.guild_id) {
            (Some(current), Some(newer)) => current == newer,
            _ => true,
        }
    }

    fn keep_parent(&mut self, older: &Self) {
        if self.guild_id.is_none() {
            self.guild_id = older.guild_id;
        }
    }

    fn index(&self, cache: &Cache) {
        if let Some(guild_id) = self.guild_id {
            upsert_guild_item(&cache.0.guild_channels, guild_id, self.id);
        }
    }

    fn unindex(&self, cache: &Cache) {
        if let Some(guild_id) = self.guild_id {
            remove_guild_item(&cache.0.guild_channels, &guild_id, &self.id);
        }
    }
}

impl Cached for CachedRole {
    type Key = RoleId;

    const KIND: EntityKind = EntityKind::Role;

    fn key(&self) -> RoleId {
        self.id
    }

    fn entity_key(key: RoleId) -> EntityKey {
        EntityKey::Role(key)
    }

    fn entity(value: Arc<Self>) -> Entity {
        Entity::Role(value)
    }

    fn bucket(cache: &CacheRef) -> &DashMap<RoleId, Arc<Self>> {
        &cache.roles
    }

    fn gauge(stats: &CacheStats) -> &IntGauge {
        &stats.resource_counts.roles
    }

    fn same_parent(&self, newer: &Self) -> bool {
        self.guild_id == newer.guild_id
    }

    fn index(&self, cache: &Cache) {
        upsert_guild_item(&cache.0.guild_roles, self.guild_id, self.id);
    }

    fn unindex(&self, cache: &Cache) {
        remove_guild_item(&cache.0.guild_roles, &self.guild_id, &self.id);
    }
}

impl Cached for CachedMember {
    type Key = (GuildId, UserId);

    const KIND: EntityKind = EntityKind::Member;
    const MERGE_ON_UPSERT: bool = true;

    fn key(&self) -> (GuildId, UserId) {
        (self.guild_id, self.user_id)
    }

    fn entity_key((guild_id, user_id): (GuildId, UserId)) -> EntityKey {
        EntityKey::Member(guild_id, user_id)
    }

    fn entity(value: Arc<Self>) -> Entity {
        Entity::Member(value)
    }

    fn bucket(cache: &CacheRef) -> &DashMap<(GuildId, UserId), Arc<Self>> {
        &cache.members
    }

    fn gauge(stats: &CacheStats) -> &IntGauge {
        &stats.resource_counts.members
    }

    fn index(&self, cache: &Cache) {
        upsert_guild_item(&cache.0.guild_members, self.guild_id, self.user_id);
    }

    fn unindex(&self, cache: &Cache) {
        remove_guild_item(&cache.0.guild_members, &self.guild_id, &self.user_id);
    }
}

impl Cached for Message {
    type Key = MessageId;

    const KIND: EntityKind = EntityKind::Message;

    fn key(&self) -> MessageId {
        self.id
    }

    fn entity_key(key: MessageId) -> EntityKey {
        EntityKey::Message(key)
    }

    fn entity(value: Arc<Self>) -> Entity {
        Entity::Message(value)
    }

    fn bucket(cache: &CacheRef) -> &DashMap<MessageId, Arc<Self>> {
        &cache.messages
    }

    fn gauge(stats: &CacheStats) -> &IntGauge {
        &stats.resource_counts.messages
    }

    fn same_parent(&self, newer: &Self) -> bool {
        self.channel_id == newer.channel_id
    }

    fn index(&self, cache: &Cache) {
        cache.index_message(self.channel_id, self.id);
    }

    fn unindex(&self, cache: &Cache) {
        if let Some(mut ids) = cache.0.channel_messages.get_mut(&self.channel_id) {
            ids.retain(|id| *id != self.id);
        }
    }
}

impl Cached for User {
    type Key = UserId;

    const KIND: EntityKind = EntityKind::User;
    const MERGE_ON_UPSERT: bool = true;

    fn key(&self) -> UserId {
        self.id
    }

    fn entity_key(key: UserId) -> EntityKey {
        EntityKey::User(key)
    }

    fn entity(value: Arc<Self>) -> Entity {
        Entity::User(value)
    }

    fn bucket(cache: &CacheRef) -> &DashMap<UserId, Arc<Self>> {
        &cache.users
    }

    fn gauge(stats: &CacheStats) -> &IntGauge {
        &stats.resource_counts.users
    }
}

pub struct CacheRef {
    channels: DashMap<ChannelId, Arc<CachedChannel>>,
    guilds: DashMap<GuildId, Arc<CachedGuild>>,
    members: DashMap<(GuildId, UserId), Arc<CachedMember>>,
    messages: DashMap<MessageId, Arc<Message>>,
    roles: DashMap<RoleId, Arc<CachedRole>>,
    users: DashMap<UserId, Arc<User>>,

    guild_roles: DashMap<GuildId, HashSet<RoleId>>,
    guild_channels: DashMap<GuildId, HashSet<ChannelId>>,
    guild_members: DashMap<GuildId, HashSet<UserId>>,
    channel_messages: DashMap<ChannelId, VecDeque<MessageId>>,

    current_user: RwLock<Option<Arc<User>>>,

    message_limit: usize,
    changes: ChangeSink,
    stats: Arc<CacheStats>,
}

/// The object store. Cloning is cheap and every clone sees the same data.
///
/// Reads hand out `Arc` snapshots, so a reader either sees a value as it was
/// before a write or as it is after, never something in between. Writes go
/// through [`Merger`] only.
#[derive(Clone)]
pub struct Cache(Arc<CacheRef>);

impl Cache {
    /// `changes` receives a [`Notification`] for every event the merger applies.
    #[must_use]
    pub fn new(message_limit: usize, stats: Arc<CacheStats>, changes: ChangeSink) -> Self {
        Self(Arc::new(CacheRef {
            channels: DashMap::new(),
            guilds: DashMap::new(),
            members: DashMap::new(),
            messages: DashMap::new(),
            roles: DashMap::new(),
            users: DashMap::new(),
            guild_roles: DashMap::new(),
            guild_channels: DashMap::new(),
            guild_members: DashMap::new(),
            channel_messages: DashMap::new(),
            current_user: RwLock::new(None),
            message_limit,
            changes,
            stats,
        }))
    }

    /// Look up any entity by its key.
    pub fn get(&self, key: EntityKey) -> Option<Entity> {
        match key {
            EntityKey::Guild(id) => self.guild(id).map(Entity::Guild),
            EntityKey::Channel(id) => self.channel(id).map(Entity::Channel),
            EntityKey::Role(id) => self.role(id).map(Entity::Role),
            EntityKey::Member(guild_id, user_id) => {
                self.member(guild_id, user_id).map(Entity::Member)
            }
            EntityKey::Message(id) => self.message(id).map(Entity::Message),
            EntityKey::User(id) => self.user(id).map(Entity::User),
        }
    }

    /// Returns the logged in user
    pub fn current_user(&self) -> Option<Arc<User>> {
        self.0
            .current_user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get an immutable reference to a channel
    pub fn channel(&self, channel_id: ChannelId) -> Option<Arc<CachedChannel>> {
        self.0
            .channels
            .get(&channel_id)
            .map(|c| Arc::clone(c.value()))
    }

    /// Get a cloned list of the channel ids of a particular guild
    pub fn guild_channels(&self, guild_id: GuildId) -> HashSet<ChannelId> {
        self.0
            .guild_channels
            .get(&guild_id)
            .map_or_else(HashSet::new, |gc| gc.value().clone())
    }

    /// Get an immutable reference to the guild struct
    pub fn guild(&self, guild_id: GuildId) -> Option<Arc<CachedGuild>> {
        self.0.guilds.get(&guild_id).map(|g| Arc::clone(g.value()))
    }

    /// Get a list of all guild ids inside the cache
    pub fn guilds(&self) -> Vec<GuildId> {
        self.0.guilds.iter().map(|g| *g.key()).collect()
    }

    /// Get an immutable reference to a certain user in a certain guild
    pub fn member(&self, guild_id: GuildId, user_id: UserId) -> Option<Arc<CachedMember>> {
        self.0
            .members
            .get(&(guild_id, user_id))
            .map(|m| Arc::clone(m.value()))
    }

    /// Get a list of all member ids inside a guild
    pub fn members(&self, guild_id: GuildId) -> HashSet<UserId> {
        self.0
            .guild_members
            .get(&guild_id)
            .map_or_else(HashSet::new, |g| g.value().clone())
    }

    pub fn message(&self, message_id: MessageId) -> Option<Arc<Message>> {
        self.0
            .messages
            .get(&message_id)
            .map(|m| Arc::clone(m.value()))
    }

    /// The cached recent messages of a channel, oldest first
    pub fn channel_messages(&self, channel_id: ChannelId) -> Vec<Arc<Message>> {
        let ids = self
            .0
            .channel_messages
            .get(&channel_id)
            .map(|ids| ids.value().iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.message(id)).collect()
    }

    /// Get an immutable reference of a certain role
    pub fn role(&self, role_id: RoleId) -> Option<Arc<CachedRole>> {
        self.0.roles.get(&role_id).map(|r| Arc::clone(r.value()))
    }

    /// Get a list of all role ids inside a guild
    pub fn roles(&self, guild_id: GuildId) -> HashSet<RoleId> {
        self.0
            .guild_roles
            .get(&guild_id)
            .map_or_else(HashSet::new, |gr| gr.value().clone())
    }

    /// Get a list of all role structs inside a guild
    pub fn guild_roles(&self, guild_id: GuildId) -> Vec<Arc<CachedRole>> {
        self.roles(guild_id)
            .into_iter()
            .filter_map(|role_id| self.role(role_id))
            .collect()
    }

    /// Get an immutable reference to a certain user
    pub fn user(&self, user_id: UserId) -> Option<Arc<User>> {
        self.0.users.get(&user_id).map(|u| Arc::clone(u.value()))
    }

    /// The colour of the highest positioned coloured role of a member.
    pub fn member_color(&self, guild_id: GuildId, user_id: UserId) -> Option<u32> {
        let member = self.member(guild_id, user_id)?;
        member
            .roles
            .value()?
            .iter()
            .filter_map(|role_id| self.role(*role_id))
            .filter(|role| role.guild_id == guild_id)
            .filter_map(|role| match (role.color.value(), role.position.value()) {
                (Some(&color), Some(&position)) if color != 0 => Some((position, color)),
                _ => None,
            })
            .max_by_key(|(position, _)| *position)
            .map(|(_, color)| color)
    }

    /// Guild-wide permissions of a member. `None` while the guild, the member's
    /// roles or the `@everyone` role are not fully known.
    pub fn permissions(&self, guild_id: GuildId, user_id: UserId) -> Option<Permissions> {
        let guild = self.guild(guild_id)?;
        let member = self.member(guild_id, user_id);
        let member_roles = member.as_ref().and_then(|m| m.roles.value());
        if guild.owner_id.value() != Some(&user_id) && member_roles.is_none() {
            return None;
        }
        guild_wide_permissions(
            &guild,
            &self.role_map(guild_id),
            user_id,
            member_roles.map_or(&[][..], Vec::as_slice),
        )
    }

    /// Permissions of a member in a guild channel, overwrites applied.
    pub fn channel_permissions(&self, channel_id: ChannelId, user_id: UserId) -> Option<Permissions> {
        let channel = self.channel(channel_id)?;
        let guild_id = channel.guild_id?;
        let guild = self.guild(guild_id)?;
        let member = self.member(guild_id, user_id);
        let member_roles = member.as_ref().and_then(|m| m.roles.value());
        if guild.owner_id.value() != Some(&user_id) && member_roles.is_none() {
            return None;
        }
        channel_permissions(
            &guild,
            &self.role_map(guild_id),
            user_id,
            member_roles.map_or(&[][..], Vec::as_slice),
            &channel,
        )
    }

    fn role_map(&self, guild_id: GuildId) -> HashMap<RoleId, Arc<CachedRole>> {
        self.guild_roles(guild_id)
            .into_iter()
            .map(|r| (r.id, r))
            .collect()
    }

    /// Writes `value` into its bucket, merging field by field when `merge` is
    /// set. Returns `Op::Update` for an existing entity even when nothing about
    /// it changed.
    fn write<E: Cached>(&self, mut value: E, merge: bool) -> Result<(Op, Arc<E>), CacheError> {
        let key = value.key();
        let (op, stored) = match E::bucket(&self.0).entry(key) {
            Entry::Occupied(mut e) => {
                value.keep_parent(e.get());
                if !e.get().same_parent(&value) {
                    error!(kind = ?E::KIND, key = ?key, "Refusing to move a cached entity to another parent");
                    return Err(CacheError::invariant(
                        E::KIND,
                        format!("{key:?} would change its parent reference"),
                    ));
                }
                let next = if merge {
                    let mut next = (**e.get()).clone();
                    next.merge(value);
                    next
                } else {
                    value
                };
                if next == **e.get() {
                    return Ok((Op::Update, Arc::clone(e.get())));
                }
                let next = Arc::new(next);
                e.insert(Arc::clone(&next));
                (Op::Update, next)
            }
            Entry::Vacant(e) => {
                let value = Arc::new(value);
                e.insert(Arc::clone(&value));
                (Op::Create, value)
            }
        };

        if op == Op::Create {
            E::gauge(&self.0.stats).inc();
        }
        // indexing may evict from the bucket, so the entry lock is released first
        stored.index(self);
        Ok((op, stored))
    }

    fn remove<E: Cached>(&self, key: E::Key) -> Option<Arc<E>> {
        let (_, removed) = E::bucket(&self.0).remove(&key)?;
        E::gauge(&self.0.stats).dec();
        removed.unindex(self);
        Some(removed)
    }

    pub(crate) fn cache_current_user(&self, user: User) {
        let mut current = self
            .0
            .current_user
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = current.as_mut().filter(|existing| existing.id == user.id) {
            Arc::make_mut(existing).merge(user);
            return;
        }
        *current = Some(Arc::new(user));
    }

    fn index_message(&self, channel_id: ChannelId, message_id: MessageId) {
        let evicted = {
            let mut ids = self.0.channel_messages.entry(channel_id).or_default();
            if !ids.contains(&message_id) {
                ids.push_back(message_id);
            }
            let overflow = ids.len().saturating_sub(self.0.message_limit);
            ids.drain(..overflow).collect::<Vec<_>>()
        };
        for id in evicted {
            if self.0.messages.remove(&id).is_some() {
                self.0.stats.resource_counts.messages.dec();
                trace!(channel = ?channel_id, message = ?id, "Evicted message");
            }
        }
    }

    pub(crate) fn publish(&self, notification: Notification) {
        if let Err(err) = self.0.changes.send(notification) {
            trace!(event = err.0.event, "No dispatcher is listening for changes");
        }
    }
}

/// The store writes made on behalf of one event. Every write is recorded as a
/// [`Change`] so the event's notification can carry them.
pub(crate) struct Writes<'a> {
    cache: &'a Cache,
    changes: Vec<Change>,
}

impl<'a> Writes<'a> {
    pub fn new(cache: &'a Cache) -> Self {
        Self {
            cache,
            changes: Vec::new(),
        }
    }

    /// Replace a whole-value kind, or merge a partial-profile kind.
    pub fn upsert<E: Cached>(&mut self, value: E) -> Result<Arc<E>, CacheError> {
        let (op, stored) = self.cache.write(value, E::MERGE_ON_UPSERT)?;
        self.record(op, E::entity_key(stored.key()), E::entity(Arc::clone(&stored)));
        Ok(stored)
    }

    /// Field-level merge over whatever is cached. Creates a stub when nothing is.
    pub fn merge<E: Cached>(&mut self, value: E) -> Result<Arc<E>, CacheError> {
        let (op, stored) = self.cache.write(value, true)?;
        self.record(op, E::entity_key(stored.key()), E::entity(Arc::clone(&stored)));
        Ok(stored)
    }

    /// Remove an entity. Removing something that isn't cached is a no-op.
    pub fn delete<E: Cached>(&mut self, key: E::Key) -> Option<Arc<E>> {
        let removed = self.cache.remove::<E>(key)?;
        self.record(Op::Delete, E::entity_key(key), E::entity(Arc::clone(&removed)));
        Some(removed)
    }

    /// Remove a channel together with its cached messages.
    pub fn delete_channel(&mut self, channel_id: ChannelId) -> Option<Arc<CachedChannel>> {
        if let Some((_, ids)) = self.cache.0.channel_messages.remove(&channel_id) {
            for id in ids {
                self.delete::<Message>(id);
            }
        }
        self.delete::<CachedChannel>(channel_id)
    }

    /// Remove a guild and everything keyed under it, including messages of
    /// channels that were never cached.
    pub fn delete_guild(&mut self, guild_id: GuildId) -> Option<Arc<CachedGuild>> {
        if let Some((_, ids)) = self.cache.0.guild_channels.remove(&guild_id) {
            for id in ids {
                self.delete_channel(id);
            }
        }
        let orphans = self
            .cache
            .0
            .messages
            .iter()
            .filter(|m| m.guild_id == Some(guild_id))
            .map(|m| *m.key())
            .collect::<Vec<_>>();
        for id in orphans {
            self.delete::<Message>(id);
        }
        if let Some((_, ids)) = self.cache.0.guild_roles.remove(&guild_id) {
            for id in ids {
                self.delete::<CachedRole>(id);
            }
        }
        if let Some((_, ids)) = self.cache.0.guild_members.remove(&guild_id) {
            for id in ids {
                self.delete::<CachedMember>((guild_id, id));
            }
        }
        self.delete::<CachedGuild>(guild_id)
    }

    pub fn into_changes(self) -> Vec<Change> {
        self.changes
    }

    fn record(&mut self, op: Op, key: EntityKey, value: Entity) {
        self.changes.push(Change {
            op,
            kind: key.kind(),
            key,
            value: Some(value),
        });
    }
}

impl Deref for Writes<'_> {
    type Target = Cache;

    fn deref(&self) -> &Cache {
        self.cache
    }
}

pub fn guild_wide_permissions(
    guild: &CachedGuild,
    roles: &HashMap<RoleId, Arc<CachedRole>>,
    member_id: UserId,
    member_roles: &[RoleId],
) -> Option<Permissions> {
    if guild.owner_id.value() == Some(&member_id) {
        return Some(Permissions::all());
    }

    // `@everyone` shares its id with the guild
    let mut permissions = *roles
        .get(&guild.id.cast::<RoleMarker>())?
        .permissions
        .value()?;

    for role in member_roles {
        if let Some(role_permissions) = roles.get(role).and_then(|r| r.permissions.value()) {
            permissions |= *role_permissions;
        }
    }

    if permissions.contains(Permissions::ADMINISTRATOR) {
        return Some(Permissions::all());
    }
    Some(permissions)
}

pub fn channel_permissions(
    guild: &CachedGuild,
    roles: &HashMap<RoleId, Arc<CachedRole>>,
    member_id: UserId,
    member_roles: &[RoleId],
    channel: &CachedChannel,
) -> Option<Permissions> {
    let mut permissions = guild_wide_permissions(guild, roles, member_id, member_roles)?;
    if permissions.contains(Permissions::ADMINISTRATOR) {
        return Some(permissions);
    }

    let mut member_allow = Permissions::empty();
    let mut member_deny = Permissions::empty();
    let mut roles_allow = Permissions::empty();
    let mut roles_deny = Permissions::empty();

    let overwrites = channel
        .permission_overwrites
        .value()
        .map_or(&[][..], Vec::as_slice);
    for overwrite in overwrites {
        match overwrite.kind {
            PermissionOverwriteType::Role => {
                let role = overwrite.id.cast::<RoleMarker>();
                if role == guild.id.cast::<RoleMarker>() {
                    permissions.remove(overwrite.deny);
                    permissions.insert(overwrite.allow);
                    continue;
                }

                if !member_roles.contains(&role) {
                    continue;
                }

                roles_allow.insert(overwrite.allow);
                roles_deny.insert(overwrite.deny);
            }
            PermissionOverwriteType::Member if overwrite.id.cast::<UserMarker>() == member_id => {
                member_allow.insert(overwrite.allow);
                member_deny.insert(overwrite.deny);
            }
            _ => {}
        }
    }
    permissions.remove(roles_deny);
    permissions.insert(roles_allow);
    permissions.remove(member_deny);
    permissions.insert(member_allow);

    Some(permissions)
}

#[cfg(test)]
mod tests {
    use super::{change, Cache, CachedChannel, CachedMember, CachedRole, Writes};
    use cordstate_models::{
        discord::guild::Permissions,
        event::{EntityKind, Op},
        field::Field,
        id::Id,
        message::Message,
        stats::CacheStats,
    };
    use std::sync::Arc;

    fn cache() -> Cache {
        let (sink, _) = change::channel();
        let stats = Arc::new(CacheStats::new().unwrap());
        Cache::new(2, stats, sink)
    }

    fn member(nick: Field<String>, roles: Field<Vec<u64>>) -> CachedMember {
        CachedMember {
            guild_id: Id::new(1),
            user_id: Id::new(2),
            nick,
            roles: roles.map(|roles| roles.into_iter().map(Id::new).collect()),
            joined_at: Field::Unknown,
        }
    }

    fn ops(writes: Writes<'_>) -> Vec<(Op, EntityKind)> {
        writes
            .into_changes()
            .into_iter()
            .map(|change| (change.op, change.kind))
            .collect()
    }

    #[test]
    fn member_upsert_merges_fields() {
        let cache = cache();
        let mut writes = Writes::new(&cache);
        writes
            .upsert(member(Field::Value("A".into()), Field::Value(vec![1, 2])))
            .unwrap();
        let merged = writes
            .upsert(member(Field::Unknown, Field::Value(vec![1, 2, 3])))
            .unwrap();

        assert_eq!(merged.nick.value().map(String::as_str), Some("A"));
        assert_eq!(merged.roles.value().map(Vec::len), Some(3));
    }

    #[test]
    fn role_upsert_replaces_and_refuses_guild_moves() {
        let cache = cache();
        let mut writes = Writes::new(&cache);
        let role = |guild: u64, color: Field<u32>| CachedRole {
            id: Id::new(10),
            guild_id: Id::new(guild),
            name: Field::Value("mods".into()),
            color,
            permissions: Field::Value(Permissions::empty()),
            position: Field::Value(1),
        };
        writes.upsert(role(1, Field::Value(5))).unwrap();
        let replaced = writes.upsert(role(1, Field::Unknown)).unwrap();
        assert_eq!(replaced.color, Field::Unknown);

        assert!(writes.upsert(role(2, Field::Value(5))).is_err());
        assert_eq!(cache.role(Id::new(10)).unwrap().guild_id, Id::new(1));

        assert_eq!(
            ops(writes),
            vec![(Op::Create, EntityKind::Role), (Op::Update, EntityKind::Role)]
        );
    }

    #[test]
    fn unchanged_write_still_reports_an_update() {
        let cache = cache();
        let mut writes = Writes::new(&cache);
        let value = member(Field::Value("A".into()), Field::Unknown);
        let first = writes.upsert(value.clone()).unwrap();
        let second = writes.upsert(value).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            ops(writes),
            vec![(Op::Create, EntityKind::Member), (Op::Update, EntityKind::Member)]
        );
        assert_eq!(cache.0.stats.resource_counts.members.get(), 1);
    }

    #[test]
    fn deleting_missing_entity_is_noop() {
        let cache = cache();
        let mut writes = Writes::new(&cache);
        assert!(writes.delete::<CachedRole>(Id::new(5)).is_none());
        assert!(writes.delete_guild(Id::new(5)).is_none());
        assert!(writes.into_changes().is_empty());
    }

    #[test]
    fn guild_delete_reaches_messages_of_uncached_channels() {
        let cache = cache();
        let mut writes = Writes::new(&cache);
        let message: Message = serde_json::from_str(
            r#"{"id":"10","channel_id":"99","guild_id":"1","content":"in a thread"}"#,
        )
        .unwrap();
        writes.upsert(message).unwrap();
        let elsewhere: Message =
            serde_json::from_str(r#"{"id":"11","channel_id":"98","guild_id":"2"}"#).unwrap();
        writes.upsert(elsewhere).unwrap();

        writes.delete_guild(Id::new(1));
        assert!(cache.message(Id::new(10)).is_none());
        assert!(cache.channel_messages(Id::new(99)).is_empty());
        assert!(cache.message(Id::new(11)).is_some());
    }

    #[test]
    fn channel_replace_without_guild_keeps_its_parent() {
        let cache = cache();
        let mut writes = Writes::new(&cache);
        let channel = |guild_id| CachedChannel {
            id: Id::new(3),
            guild_id,
            kind: Field::Unknown,
            name: Field::Value("general".into()),
            position: Field::Unknown,
            parent_id: Field::Unknown,
            permission_overwrites: Field::Unknown,
        };
        writes.upsert(channel(Some(Id::new(1)))).unwrap();
        let replaced = writes.upsert(channel(None)).unwrap();

        assert_eq!(replaced.guild_id, Some(Id::new(1)));
        assert!(cache.guild_channels(Id::new(1)).contains(&Id::new(3)));
        assert!(writes.upsert(channel(Some(Id::new(2)))).is_err());
    }
}
