use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{field::Field, id::RoleId, user::User};

/// A guild member as it appears on the wire. The guild comes from the
/// enclosing event.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Member {
    pub user: User,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub nick: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub roles: Field<Vec<RoleId>>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub joined_at: Field<DateTime<Utc>>,
}

/// The member overlay attached to a message, without its user.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PartialMember {
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub nick: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub roles: Field<Vec<RoleId>>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub joined_at: Field<DateTime<Utc>>,
}

impl PartialMember {
    pub fn with_user(self, user: User) -> Member {
        Member {
            user,
            nick: self.nick,
            roles: self.roles,
            joined_at: self.joined_at,
        }
    }
}
