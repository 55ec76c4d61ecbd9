use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    field::{Field, Merge},
    id::{ChannelId, GuildId, MessageId, WebhookId},
    user::User,
};

/// A message. The author is the user snapshot sent along with the message,
/// which may be newer or older than the cached user or member.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub author: Field<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<WebhookId>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub content: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub timestamp: Field<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub edited_timestamp: Field<DateTime<Utc>>,
}

impl Merge for Message {
    fn merge(&mut self, newer: Self) {
        if self.guild_id.is_none() {
            self.guild_id = newer.guild_id;
        }
        if newer.webhook_id.is_some() {
            self.webhook_id = newer.webhook_id;
        }
        match (&mut self.author, newer.author) {
            (Field::Value(author), Field::Value(newer)) if author.id == newer.id => {
                author.merge(newer);
            }
            (author, newer) => author.merge(newer),
        }
        self.content.merge(newer.content);
        self.timestamp.merge(newer.timestamp);
        self.edited_timestamp.merge(newer.edited_timestamp);
    }
}
