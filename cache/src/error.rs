use std::{
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
};

use cordstate_models::event::EntityKind;

use crate::fetch::FetchError;

#[derive(Debug)]
pub struct CacheError {
    pub(crate) source: Option<Box<dyn StdError + Send + Sync>>,
    pub(crate) kind: ErrorKind,
}

impl CacheError {
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_source(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.source
    }

    pub fn into_parts(self) -> (ErrorKind, Option<Box<dyn StdError + Send + Sync>>) {
        (self.kind, self.source)
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self {
            source: None,
            kind: ErrorKind::MalformedPayload(reason.into()),
        }
    }

    pub(crate) fn invariant(kind: EntityKind, context: impl Into<String>) -> Self {
        Self {
            source: None,
            kind: ErrorKind::InvariantViolation {
                kind,
                context: context.into(),
            },
        }
    }

    pub(crate) fn config(
        key: &str,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            source: Some(source.into()),
            kind: ErrorKind::Config(key.to_owned()),
        }
    }
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            ErrorKind::MalformedPayload(reason) => write!(f, "malformed event payload: {reason}")?,
            ErrorKind::InvariantViolation { kind, context } => {
                write!(f, "cache invariant violated for {kind:?}: {context}")?;
            }
            ErrorKind::Fetch => f.write_str("on-demand fetch failed")?,
            ErrorKind::Config(key) => write!(f, "invalid configuration value for {key}")?,
            ErrorKind::Metrics => f.write_str("failed to set up cache metrics")?,
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for CacheError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn StdError + 'static))
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The event could not be decoded or contradicts itself. It is dropped.
    MalformedPayload(String),
    /// A write would have broken an identity invariant, such as moving a
    /// role to another guild. The write is refused.
    InvariantViolation { kind: EntityKind, context: String },
    Fetch,
    Config(String),
    Metrics,
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            source: Some(Box::new(err)),
            kind: ErrorKind::MalformedPayload("undecodable event".into()),
        }
    }
}

impl From<FetchError> for CacheError {
    fn from(err: FetchError) -> Self {
        Self {
            source: Some(Box::new(err)),
            kind: ErrorKind::Fetch,
        }
    }
}

impl From<prometheus::Error> for CacheError {
    fn from(err: prometheus::Error) -> Self {
        Self {
            source: Some(Box::new(err)),
            kind: ErrorKind::Metrics,
        }
    }
}
