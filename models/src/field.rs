use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A field of a possibly partial entity.
///
/// `Unknown` means the field has never been observed, which is what a stub
/// record holds until a fuller payload arrives. `Null` means the remote side
/// said explicitly that the field is empty (a cleared nickname, a message that
/// was never edited). In JSON an absent key decodes to `Unknown` and a `null`
/// to `Null`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Field<T> {
    Unknown,
    Null,
    Value(T),
}

impl<T> Field<T> {
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    pub const fn is_known(&self) -> bool {
        !self.is_unknown()
    }

    pub const fn value(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Unknown | Self::Null => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Unknown | Self::Null => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Field<U> {
        match self {
            Self::Unknown => Field::Unknown,
            Self::Null => Field::Null,
            Self::Value(v) => Field::Value(f(v)),
        }
    }

    pub const fn as_ref(&self) -> Field<&T> {
        match self {
            Self::Unknown => Field::Unknown,
            Self::Null => Field::Null,
            Self::Value(v) => Field::Value(v),
        }
    }
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::Unknown
    }
}

impl<T> From<T> for Field<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

impl<T> From<Option<T>> for Field<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Self::Value)
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) => serializer.serialize_some(v),
            Self::Unknown | Self::Null => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Self::from)
    }
}

/// Field-level merge: whatever the newer value knows overwrites, whatever it
/// doesn't know is kept.
pub trait Merge {
    fn merge(&mut self, newer: Self);
}

impl<T> Merge for Field<T> {
    fn merge(&mut self, newer: Self) {
        if newer.is_known() {
            *self = newer;
        }
    }
}
