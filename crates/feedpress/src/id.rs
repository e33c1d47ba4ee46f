//! Typed UUID identifiers.
//!
//! `Id<T>` wraps a `Uuid` with a phantom entity marker so a `RuleId` can never be
//! passed where an `ArticleId` is expected. New ids are UUID v7 (time ordered),
//! which keeps storage indexes append-friendly.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// A typed wrapper around `Uuid`.
#[repr(transparent)]
pub struct Id<T>(Uuid, PhantomData<fn() -> T>);

impl<T> Id<T> {
    /// Creates a fresh time-ordered id.
    #[inline]
    pub fn new() -> Self {
        Self(Uuid::now_v7(), PhantomData)
    }

    /// Wraps an existing `Uuid`, e.g. one loaded from storage.
    #[inline]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid, PhantomData)
    }

    #[inline]
    pub fn into_uuid(self) -> Uuid {
        self.0
    }

    #[inline]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for Id<T> {}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.0)
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<T> FromStr for Id<T> {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self::from_uuid)
    }
}

impl<T> From<Uuid> for Id<T> {
    fn from(uuid: Uuid) -> Self {
        Self::from_uuid(uuid)
    }
}

impl<T> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Uuid::deserialize(deserializer).map(Self::from_uuid)
    }
}

/// Entity marker types. Only used as the `T` of [`Id<T>`].
pub mod marker {
    pub struct Source;
    pub struct Rule;
    pub struct FeedItem;
    pub struct Article;
    pub struct Publication;
}

pub type SourceId = Id<marker::Source>;
pub type RuleId = Id<marker::Rule>;
pub type FeedItemId = Id<marker::FeedItem>;
pub type ArticleId = Id<marker::Article>;
pub type PublicationId = Id<marker::Publication>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_time_ordered() {
        let first = ArticleId::new();
        let second = ArticleId::new();
        assert!(first < second);
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = SourceId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));

        let back: SourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_parse_round_trips_display() {
        let id = RuleId::new();
        let parsed: RuleId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<RuleId>().is_err());
    }
}
