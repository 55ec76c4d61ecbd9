use cordstate_models::{
    channel::Channel,
    discord::channel::{permission_overwrite::PermissionOverwrite, ChannelType},
    field::{Field, Merge},
    id::{ChannelId, GuildId},
};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CachedChannel {
    pub id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub kind: Field<ChannelType>,
    pub name: Field<String>,
    pub position: Field<i64>,
    pub parent_id: Field<ChannelId>,
    pub permission_overwrites: Field<Vec<PermissionOverwrite>>,
}

impl From<Channel> for CachedChannel {
    fn from(channel: Channel) -> Self {
        Self {
            id: channel.id,
            guild_id: channel.guild_id,
            kind: channel.kind,
            name: channel.name,
            position: channel.position,
            parent_id: channel.parent_id,
            permission_overwrites: channel.permission_overwrites,
        }
    }
}

impl Merge for CachedChannel {
    fn merge(&mut self, newer: Self) {
        if self.guild_id.is_none() {
            self.guild_id = newer.guild_id;
        }
        self.kind.merge(newer.kind);
        self.name.merge(newer.name);
        self.position.merge(newer.position);
        self.parent_id.merge(newer.parent_id);
        self.permission_overwrites.merge(newer.permission_overwrites);
    }
}
