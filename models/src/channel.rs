use serde::{Deserialize, Serialize};
use twilight_model::channel::{permission_overwrite::PermissionOverwrite, ChannelType};

use crate::{
    field::Field,
    id::{ChannelId, GuildId},
};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Channel {
    pub id: ChannelId,
    /// `None` for direct-message channels, and for guild channels nested
    /// inside a guild payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
    #[serde(default, rename = "type", skip_serializing_if = "Field::is_unknown")]
    pub kind: Field<ChannelType>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub name: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub position: Field<i64>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub parent_id: Field<ChannelId>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub permission_overwrites: Field<Vec<PermissionOverwrite>>,
}

impl Channel {
    /// Whether the channel type says this is a direct-message channel.
    /// `None` when the type is not known yet.
    pub fn is_private(&self) -> Option<bool> {
        self.kind
            .value()
            .map(|kind| matches!(kind, ChannelType::Private | ChannelType::Group))
    }
}
