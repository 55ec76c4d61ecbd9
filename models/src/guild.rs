use serde::{Deserialize, Serialize};

use crate::{
    channel::Channel,
    field::Field,
    id::{ChannelId, GuildId, UserId},
    member::Member,
    role::Role,
};

/// A guild payload. On create it is complete and carries the role, channel and
/// member lists; on update only the changed settings may be present.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Guild {
    pub id: GuildId,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub name: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub icon: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub owner_id: Field<UserId>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub preferred_locale: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub system_channel_id: Field<ChannelId>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub roles: Field<Vec<Role>>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub channels: Field<Vec<Channel>>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub members: Field<Vec<Member>>,
}
