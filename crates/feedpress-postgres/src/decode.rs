//! Row decoding and column conversions.

use std::str::FromStr;

use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use feedpress::automation::{AutomationRule, RuleRecord};
use feedpress::store::{StoreError, StoreResult};
use feedpress::{Article, FeedItem, Id, Publication, Source, UnknownVariant};

pub(crate) fn backend(error: impl Into<anyhow::Error>) -> StoreError {
    StoreError::Backend(error.into())
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name).map_err(backend)
}

fn id<T>(row: &PgRow, name: &str) -> StoreResult<Id<T>> {
    Ok(Id::from_uuid(col::<Uuid>(row, name)?))
}

fn opt_id<T>(row: &PgRow, name: &str) -> StoreResult<Option<Id<T>>> {
    Ok(col::<Option<Uuid>>(row, name)?.map(Id::from_uuid))
}

fn json<T>(row: &PgRow, name: &str) -> StoreResult<T>
where
    T: serde::de::DeserializeOwned,
{
    Ok(col::<Json<T>>(row, name)?.0)
}

fn opt_json<T>(row: &PgRow, name: &str) -> StoreResult<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    Ok(col::<Option<Json<T>>>(row, name)?.map(|j| j.0))
}

pub(crate) fn parse_status<S>(value: &str) -> StoreResult<S>
where
    S: FromStr<Err = UnknownVariant>,
{
    value.parse().map_err(backend)
}

fn status<S>(row: &PgRow, name: &str) -> StoreResult<S>
where
    S: FromStr<Err = UnknownVariant>,
{
    parse_status(&col::<String>(row, name)?)
}

/// Postgres has no unsigned integers; counters are stored as INTEGER / BIGINT.
pub(crate) fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(crate) fn from_i32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub(crate) fn limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn source(row: &PgRow) -> StoreResult<Source> {
    Ok(Source {
        id: id(row, "id")?,
        name: col(row, "name")?,
        kind: col(row, "kind")?,
        status: status(row, "status")?,
        configuration: col(row, "configuration")?,
        automation: json(row, "automation")?,
        created_at: col(row, "created_at")?,
    })
}

pub(crate) fn rule(row: &PgRow) -> StoreResult<AutomationRule> {
    Ok(AutomationRule::restore(RuleRecord {
        id: id(row, "id")?,
        source_id: id(row, "source_id")?,
        name: col(row, "name")?,
        enabled: col(row, "enabled")?,
        trigger: json(row, "trigger")?,
        conditions: json(row, "conditions")?,
        actions: json(row, "actions")?,
        execution_count: from_i64(col(row, "execution_count")?),
        last_executed_at: col(row, "last_executed_at")?,
        created_at: col(row, "created_at")?,
    }))
}

pub(crate) fn feed_item(row: &PgRow) -> StoreResult<FeedItem> {
    Ok(FeedItem {
        id: id(row, "id")?,
        source_id: id(row, "source_id")?,
        guid: col(row, "guid")?,
        url: col(row, "url")?,
        title: col(row, "title")?,
        content: col(row, "content")?,
        published_at: col(row, "published_at")?,
        fetched_at: col(row, "fetched_at")?,
        status: status(row, "status")?,
        article_id: opt_id(row, "article_id")?,
    })
}

pub(crate) fn article(row: &PgRow) -> StoreResult<Article> {
    Ok(Article {
        id: id(row, "id")?,
        source_id: id(row, "source_id")?,
        feed_item_id: opt_id(row, "feed_item_id")?,
        title: col(row, "title")?,
        content: col(row, "content")?,
        excerpt: col(row, "excerpt")?,
        slug: col(row, "slug")?,
        seo: json(row, "seo")?,
        status: status(row, "status")?,
        version: col(row, "version")?,
        flags: json(row, "flags")?,
        generation: json(row, "generation")?,
        featured_media: opt_json(row, "featured_media")?,
        publish_target: opt_json(row, "publish_target")?,
        last_error: col(row, "last_error")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

pub(crate) fn publication(row: &PgRow) -> StoreResult<Publication> {
    Ok(Publication {
        id: id(row, "id")?,
        article_id: id(row, "article_id")?,
        target: json(row, "target")?,
        status: status(row, "status")?,
        retry_count: from_i32(col(row, "retry_count")?),
        max_retries: from_i32(col(row, "max_retries")?),
        external_id: col(row, "external_id")?,
        external_url: col(row, "external_url")?,
        scheduled_at: col(row, "scheduled_at")?,
        published_at: col(row, "published_at")?,
        content: json(row, "content")?,
        metadata: json(row, "metadata")?,
        last_error: col(row, "last_error")?,
        idempotency_key: col(row, "idempotency_key")?,
        allow_duplicate: col(row, "allow_duplicate")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedpress::{ArticleStatus, PublicationStatus};

    #[test]
    fn test_parse_status_reads_stored_spelling() {
        let status: ArticleStatus = parse_status("ready_to_publish").unwrap();
        assert_eq!(status, ArticleStatus::ReadyToPublish);
    }

    #[test]
    fn test_unknown_status_is_backend_error() {
        let err = parse_status::<PublicationStatus>("archived").unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(err.to_string().contains("archived"));
    }

    #[test]
    fn test_counter_conversions_saturate() {
        assert_eq!(to_i32(u32::MAX), i32::MAX);
        assert_eq!(from_i32(-1), 0);
        assert_eq!(from_i32(3), 3);
        assert_eq!(to_i64(7), 7);
        assert_eq!(from_i64(-5), 0);
        assert_eq!(limit(usize::MAX), i64::MAX);
    }
}
