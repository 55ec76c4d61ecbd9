use cordstate_models::{
    chrono::{DateTime, Utc},
    field::{Field, Merge},
    id::{GuildId, RoleId, UserId},
    member::Member,
};

/// The guild-scoped overlay of a user. The user's own profile is cached
/// separately and shared between guilds.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CachedMember {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub nick: Field<String>,
    pub roles: Field<Vec<RoleId>>,
    pub joined_at: Field<DateTime<Utc>>,
}

impl CachedMember {
    pub fn new(guild_id: GuildId, member: Member) -> Self {
        Self {
            guild_id,
            user_id: member.user.id,
            nick: member.nick,
            roles: member.roles,
            joined_at: member.joined_at,
        }
    }

    /// A stub is a member seen only in passing, whose roles or join date
    /// have not arrived yet.
    pub const fn is_stub(&self) -> bool {
        self.roles.is_unknown() || self.joined_at.is_unknown()
    }
}

impl Merge for CachedMember {
    fn merge(&mut self, newer: Self) {
        self.nick.merge(newer.nick);
        self.roles.merge(newer.roles);
        self.joined_at.merge(newer.joined_at);
    }
}
