use std::sync::Arc;

use cordstate_models::{
    event::{EntityKind, Op},
    id::{ChannelId, GuildId, MessageId, RoleId, UserId},
    message::Message,
    user::User,
};
use tokio::sync::mpsc;

use crate::{CachedChannel, CachedGuild, CachedMember, CachedRole};

/// Identity key of a cached entity.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EntityKey {
    Guild(GuildId),
    Channel(ChannelId),
    Role(RoleId),
    Member(GuildId, UserId),
    Message(MessageId),
    User(UserId),
}

impl EntityKey {
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Guild(_) => EntityKind::Guild,
            Self::Channel(_) => EntityKind::Channel,
            Self::Role(_) => EntityKind::Role,
            Self::Member(..) => EntityKind::Member,
            Self::Message(_) => EntityKind::Message,
            Self::User(_) => EntityKind::User,
        }
    }
}

/// A snapshot of a cached entity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Entity {
    Guild(Arc<CachedGuild>),
    Channel(Arc<CachedChannel>),
    Role(Arc<CachedRole>),
    Member(Arc<CachedMember>),
    Message(Arc<Message>),
    User(Arc<User>),
}

/// One store write. Rewriting an entity with an equal value still counts as
/// an update. For deletes `value` holds the last cached snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Change {
    pub op: Op,
    pub kind: EntityKind,
    pub key: EntityKey,
    pub value: Option<Entity>,
}

/// Sent once for every event the merger applied. `op` and `kind` are the
/// event's own, so a member update that had to create the member is still an
/// update.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notification {
    pub op: Op,
    pub kind: EntityKind,
    pub event: &'static str,
    /// Store writes in the order the event made them.
    pub changes: Vec<Change>,
}

pub type ChangeSink = mpsc::UnboundedSender<Notification>;
pub type ChangeStream = mpsc::UnboundedReceiver<Notification>;

pub fn channel() -> (ChangeSink, ChangeStream) {
    mpsc::unbounded_channel()
}
