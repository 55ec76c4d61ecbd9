use serde::{Deserialize, Serialize};

use crate::{
    field::{Field, Merge},
    id::UserId,
};

/// A global user profile, independent of any guild.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct User {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub username: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub avatar: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub bot: Field<bool>,
}

impl User {
    /// A record that knows nothing but the identity.
    pub const fn stub(id: UserId) -> Self {
        Self {
            id,
            username: Field::Unknown,
            avatar: Field::Unknown,
            bot: Field::Unknown,
        }
    }

    pub const fn is_stub(&self) -> bool {
        self.username.is_unknown()
    }

    pub fn is_bot(&self) -> bool {
        self.bot.value().copied().unwrap_or_default()
    }
}

impl Merge for User {
    fn merge(&mut self, newer: Self) {
        self.username.merge(newer.username);
        self.avatar.merge(newer.avatar);
        self.bot.merge(newer.bot);
    }
}
