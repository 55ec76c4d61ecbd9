use serde::{Deserialize, Serialize};
use twilight_model::guild::Permissions;

use crate::{field::Field, id::RoleId};

/// A role as it appears on the wire. Roles carry no guild reference of their
/// own; the enclosing event or guild payload supplies it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Role {
    pub id: RoleId,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub name: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub color: Field<u32>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub permissions: Field<Permissions>,
    #[serde(default, skip_serializing_if = "Field::is_unknown")]
    pub position: Field<i64>,
}
