use cordstate_models::{
    field::{Field, Merge},
    guild::Guild,
    id::{ChannelId, GuildId, UserId},
};

/// A guild's own settings. Roles, channels and members live in their own
/// buckets and are reached through the guild indexes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CachedGuild {
    pub id: GuildId,
    pub name: Field<String>,
    pub icon: Field<String>,
    pub owner_id: Field<UserId>,
    pub preferred_locale: Field<String>,
    pub system_channel_id: Field<ChannelId>,
}

impl From<&Guild> for CachedGuild {
    fn from(guild: &Guild) -> Self {
        Self {
            id: guild.id,
            name: guild.name.clone(),
            icon: guild.icon.clone(),
            owner_id: guild.owner_id.clone(),
            preferred_locale: guild.preferred_locale.clone(),
            system_channel_id: guild.system_channel_id.clone(),
        }
    }
}

impl Merge for CachedGuild {
    fn merge(&mut self, newer: Self) {
        self.name.merge(newer.name);
        self.icon.merge(newer.icon);
        self.owner_id.merge(newer.owner_id);
        self.preferred_locale.merge(newer.preferred_locale);
        self.system_channel_id.merge(newer.system_channel_id);
    }
}
