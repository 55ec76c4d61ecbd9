use cordstate_models::{
    discord::guild::Permissions,
    field::{Field, Merge},
    id::{GuildId, RoleId},
    role::Role,
};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CachedRole {
    pub id: RoleId,
    pub guild_id: GuildId,
    pub name: Field<String>,
    pub color: Field<u32>,
    pub permissions: Field<Permissions>,
    pub position: Field<i64>,
}

impl CachedRole {
    pub fn new(guild_id: GuildId, role: Role) -> Self {
        Self {
            id: role.id,
            guild_id,
            name: role.name,
            color: role.color,
            permissions: role.permissions,
            position: role.position,
        }
    }
}

impl Merge for CachedRole {
    fn merge(&mut self, newer: Self) {
        self.name.merge(newer.name);
        self.color.merge(newer.color);
        self.permissions.merge(newer.permissions);
        self.position.merge(newer.position);
    }
}
