use serde::{Deserialize, Serialize};
use std::ops::Deref;

use crate::{
    channel::Channel,
    guild::Guild,
    id::{ChannelId, GuildId, MessageId, RoleId, UserId},
    member::{Member, PartialMember},
    message::Message,
    role::Role,
    user::User,
};

/// The mutation an event or a cache change performs.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Op {
    Create,
    Update,
    Delete,
}

/// Discriminator of the cache partition an event or change applies to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum EntityKind {
    Guild,
    Channel,
    Role,
    Member,
    Message,
    User,
}

/// A decoded gateway dispatch.
///
/// On the wire this is `{"t": "GUILD_CREATE", "d": { ... }}`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "t", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Ready(Box<Ready>),
    GuildCreate(Box<GuildCreate>),
    GuildUpdate(Box<GuildUpdate>),
    GuildDelete(GuildDelete),
    ChannelCreate(Box<ChannelCreate>),
    ChannelUpdate(Box<ChannelUpdate>),
    ChannelDelete(ChannelDelete),
    RoleCreate(Box<RoleCreate>),
    RoleUpdate(Box<RoleUpdate>),
    RoleDelete(RoleDelete),
    MemberAdd(Box<MemberAdd>),
    MemberUpdate(Box<MemberUpdate>),
    MemberRemove(MemberRemove),
    MemberChunk(MemberChunk),
    MessageCreate(Box<MessageCreate>),
    MessageUpdate(Box<MessageUpdate>),
    MessageDelete(MessageDelete),
    UserUpdate(UserUpdate),
}

impl Event {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub const fn op(&self) -> Op {
        match self {
            Self::Ready(_)
            | Self::GuildCreate(_)
            | Self::ChannelCreate(_)
            | Self::RoleCreate(_)
            | Self::MemberAdd(_)
            | Self::MessageCreate(_) => Op::Create,
            Self::GuildUpdate(_)
            | Self::ChannelUpdate(_)
            | Self::RoleUpdate(_)
            | Self::MemberUpdate(_)
            | Self::MemberChunk(_)
            | Self::MessageUpdate(_)
            | Self::UserUpdate(_) => Op::Update,
            Self::GuildDelete(_)
            | Self::ChannelDelete(_)
            | Self::RoleDelete(_)
            | Self::MemberRemove(_)
            | Self::MessageDelete(_) => Op::Delete,
        }
    }

    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::GuildCreate(_) | Self::GuildUpdate(_) | Self::GuildDelete(_) => EntityKind::Guild,
            Self::ChannelCreate(_) | Self::ChannelUpdate(_) | Self::ChannelDelete(_) => {
                EntityKind::Channel
            }
            Self::RoleCreate(_) | Self::RoleUpdate(_) | Self::RoleDelete(_) => EntityKind::Role,
            Self::MemberAdd(_)
            | Self::MemberUpdate(_)
            | Self::MemberRemove(_)
            | Self::MemberChunk(_) => EntityKind::Member,
            Self::MessageCreate(_) | Self::MessageUpdate(_) | Self::MessageDelete(_) => {
                EntityKind::Message
            }
            Self::Ready(_) | Self::UserUpdate(_) => EntityKind::User,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ready(_) => "Ready",
            Self::GuildCreate(_) => "GuildCreate",
            Self::GuildUpdate(_) => "GuildUpdate",
            Self::GuildDelete(_) => "GuildDelete",
            Self::ChannelCreate(_) => "ChannelCreate",
            Self::ChannelUpdate(_) => "ChannelUpdate",
            Self::ChannelDelete(_) => "ChannelDelete",
            Self::RoleCreate(_) => "RoleCreate",
            Self::RoleUpdate(_) => "RoleUpdate",
            Self::RoleDelete(_) => "RoleDelete",
            Self::MemberAdd(_) => "MemberAdd",
            Self::MemberUpdate(_) => "MemberUpdate",
            Self::MemberRemove(_) => "MemberRemove",
            Self::MemberChunk(_) => "MemberChunk",
            Self::MessageCreate(_) => "MessageCreate",
            Self::MessageUpdate(_) => "MessageUpdate",
            Self::MessageDelete(_) => "MessageDelete",
            Self::UserUpdate(_) => "UserUpdate",
        }
    }

    /// The guild an event is scoped to, for events that can only be applied
    /// once that guild is known. Guild events themselves return `None`.
    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            Self::ChannelCreate(v) => v.guild_id,
            Self::ChannelUpdate(v) => v.guild_id,
            Self::ChannelDelete(v) => v.guild_id,
            Self::RoleCreate(v) => Some(v.guild_id),
            Self::RoleUpdate(v) => Some(v.guild_id),
            Self::RoleDelete(v) => Some(v.guild_id),
            Self::MemberAdd(v) => Some(v.guild_id),
            Self::MemberUpdate(v) => Some(v.guild_id),
            Self::MemberRemove(v) => Some(v.guild_id),
            Self::MemberChunk(v) => Some(v.guild_id),
            Self::MessageCreate(v) => v.message.guild_id,
            Self::MessageUpdate(v) => v.guild_id,
            Self::MessageDelete(v) => v.guild_id,
            Self::Ready(_)
            | Self::GuildCreate(_)
            | Self::GuildUpdate(_)
            | Self::GuildDelete(_)
            | Self::UserUpdate(_) => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ready {
    pub user: User,
    /// Guilds the session is in; each will follow as a guild create.
    #[serde(default)]
    pub guilds: Vec<GuildId>,
    #[serde(default)]
    pub private_channels: Vec<Channel>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GuildCreate(pub Guild);

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GuildUpdate(pub Guild);

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GuildDelete {
    pub id: GuildId,
    /// Set when the guild went offline rather than being left.
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChannelCreate(pub Channel);

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChannelUpdate(pub Channel);

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChannelDelete {
    pub id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RoleCreate {
    pub guild_id: GuildId,
    pub role: Role,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RoleUpdate {
    pub guild_id: GuildId,
    pub role: Role,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RoleDelete {
    pub guild_id: GuildId,
    pub role_id: RoleId,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MemberAdd {
    pub guild_id: GuildId,
    pub member: Member,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MemberUpdate {
    pub guild_id: GuildId,
    pub member: Member,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MemberRemove {
    pub guild_id: GuildId,
    pub user_id: UserId,
}

/// A batch of members, either pushed by the gateway or produced by an
/// on-demand fetch.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MemberChunk {
    pub guild_id: GuildId,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub not_found: Vec<UserId>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MessageCreate {
    pub message: Message,
    #[serde(default)]
    pub member: Option<PartialMember>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MessageUpdate(pub Message);

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MessageDelete {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct UserUpdate(pub User);

macro_rules! deref_payload {
    ($($name:ident => $target:ty),* $(,)?) => {
        $(
            impl Deref for $name {
                type Target = $target;

                fn deref(&self) -> &Self::Target {
                    &self.0
                }
            }
        )*
    };
}

deref_payload! {
    GuildCreate => Guild,
    GuildUpdate => Guild,
    ChannelCreate => Channel,
    ChannelUpdate => Channel,
    MessageUpdate => Message,
    UserUpdate => User,
}
