//! Article lifecycle state machine.
//!
//! ```text
//! draft ─► generated ─► generated_image_draft ─► generated_with_image ─► ready_to_publish ─► published
//!   │          │                 │                        │                     │
//!   └──────────┴─────────────────┴────────────────────────┴─────────────────────┴──► failed
//! ```
//!
//! Decisions are pure: [`next_status`] maps (current status, automation flags,
//! stage result) to the next status and never looks at storage. Stage runners
//! apply the decision through an [`ArticleTransition`], which carries the
//! expected prior status and version so a concurrent writer produces a
//! conflict instead of a lost update.

use std::borrow::Cow;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Categorizable, ErrorCategory};
use crate::id::ArticleId;
use crate::model::{Article, FeaturedMedia};

status_enum! {
    /// Article status. The wire spelling is part of the external contract.
    pub enum ArticleStatus {
        Draft => "draft",
        Generated => "generated",
        GeneratedImageDraft => "generated_image_draft",
        GeneratedWithImage => "generated_with_image",
        ReadyToPublish => "ready_to_publish",
        Published => "published",
        Failed => "failed",
    }
}

impl ArticleStatus {
    /// Position along the forward path. `Failed` sits outside the path.
    pub fn rank(self) -> Option<u8> {
        match self {
            ArticleStatus::Draft => Some(0),
            ArticleStatus::Generated => Some(1),
            ArticleStatus::GeneratedImageDraft => Some(2),
            ArticleStatus::GeneratedWithImage => Some(3),
            ArticleStatus::ReadyToPublish => Some(4),
            ArticleStatus::Published => Some(5),
            ArticleStatus::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ArticleStatus::Published | ArticleStatus::Failed)
    }
}

/// Whether moving `from → to` respects the ordering (forward, or into `failed`).
pub fn is_forward(from: ArticleStatus, to: ArticleStatus) -> bool {
    if from.is_terminal() {
        return from == to;
    }
    match (from.rank(), to.rank()) {
        (_, None) => true,
        (Some(a), Some(b)) => b >= a,
        (None, Some(_)) => false,
    }
}

/// Automation switches that shape an article's path through the lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationFlags {
    pub auto_generate_image: bool,
    pub auto_publish: bool,
}

impl AutomationFlags {
    /// Flags enabled by either side win.
    pub fn union(self, other: AutomationFlags) -> AutomationFlags {
        AutomationFlags {
            auto_generate_image: self.auto_generate_image || other.auto_generate_image,
            auto_publish: self.auto_publish || other.auto_publish,
        }
    }
}

/// Outcome reported by a stage (automated runner or a human action).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageResult {
    TextGenerated,
    TextGenerationFailed { error: String },
    /// Manual request to run the image stage on a `generated` article.
    ImageRequested,
    ImageSucceeded { media: FeaturedMedia },
    ImageFailed { error: String },
    /// Manual approval of a `generated` / `generated_with_image` article.
    ApprovedForPublish,
    Published,
    PublishFailed { error: String, retries_exhausted: bool },
    /// Operator gives up on the article.
    Abandoned { reason: String },
}

impl StageResult {
    pub fn kind(&self) -> &'static str {
        match self {
            StageResult::TextGenerated => "text_generated",
            StageResult::TextGenerationFailed { .. } => "text_generation_failed",
            StageResult::ImageRequested => "image_requested",
            StageResult::ImageSucceeded { .. } => "image_succeeded",
            StageResult::ImageFailed { .. } => "image_failed",
            StageResult::ApprovedForPublish => "approved_for_publish",
            StageResult::Published => "published",
            StageResult::PublishFailed { .. } => "publish_failed",
            StageResult::Abandoned { .. } => "abandoned",
        }
    }

    fn error(&self) -> Option<&str> {
        match self {
            StageResult::TextGenerationFailed { error }
            | StageResult::ImageFailed { error }
            | StageResult::PublishFailed { error, .. } => Some(error),
            StageResult::Abandoned { reason } => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("article is already {status}")]
    Terminal { status: ArticleStatus },

    #[error("{result} is not valid for an article in status {from}")]
    Illegal {
        from: ArticleStatus,
        result: &'static str,
    },
}

impl Categorizable for TransitionError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::BusinessRule
    }

    fn code(&self) -> &'static str {
        match self {
            TransitionError::Terminal { .. } => "article_terminal",
            TransitionError::Illegal { .. } => "illegal_transition",
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        self.to_string().into()
    }
}

/// Status an article enters once its text has been generated.
pub fn initial_status(flags: AutomationFlags) -> ArticleStatus {
    match (flags.auto_generate_image, flags.auto_publish) {
        (true, _) => ArticleStatus::GeneratedImageDraft,
        (false, true) => ArticleStatus::ReadyToPublish,
        (false, false) => ArticleStatus::Generated,
    }
}

/// Decide the next status. Pure: same inputs, same answer.
///
/// A `PublishFailed` with retries remaining keeps the current status; the
/// publication record carries the retry state.
pub fn next_status(
    current: ArticleStatus,
    flags: AutomationFlags,
    result: &StageResult,
) -> Result<ArticleStatus, TransitionError> {
    use ArticleStatus::*;

    if current.is_terminal() {
        return Err(TransitionError::Terminal { status: current });
    }

    let next = match (current, result) {
        (_, StageResult::Abandoned { .. }) => Failed,

        (Draft, StageResult::TextGenerated) => initial_status(flags),
        (Draft, StageResult::TextGenerationFailed { .. }) => Failed,

        (Generated, StageResult::ImageRequested) => GeneratedImageDraft,

        (GeneratedImageDraft, StageResult::ImageSucceeded { .. }) if flags.auto_publish => {
            ReadyToPublish
        }
        (GeneratedImageDraft, StageResult::ImageSucceeded { .. }) => GeneratedWithImage,
        (GeneratedImageDraft, StageResult::ImageFailed { .. }) => Failed,

        (Generated | GeneratedWithImage, StageResult::ApprovedForPublish) => ReadyToPublish,

        (Generated | GeneratedWithImage | ReadyToPublish, StageResult::Published) => Published,
        (
            Generated | GeneratedWithImage | ReadyToPublish,
            StageResult::PublishFailed {
                retries_exhausted, ..
            },
        ) => {
            if *retries_exhausted {
                Failed
            } else {
                current
            }
        }

        (from, result) => {
            return Err(TransitionError::Illegal {
                from,
                result: result.kind(),
            })
        }
    };

    debug_assert!(is_forward(current, next));
    Ok(next)
}

/// A planned, version-checked status change for one article.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleTransition {
    pub article_id: ArticleId,
    pub expected_status: ArticleStatus,
    pub expected_version: i64,
    pub next_status: ArticleStatus,
    /// Only ever set by a successful image stage.
    pub featured_media: Option<FeaturedMedia>,
    pub error: Option<String>,
}

impl ArticleTransition {
    /// Plan the transition for `result` against the article as last read.
    pub fn plan(article: &Article, result: StageResult) -> Result<Self, TransitionError> {
        let next = next_status(article.status, article.flags, &result)?;
        let error = result.error().map(str::to_owned);
        let featured_media = match result {
            StageResult::ImageSucceeded { media } => Some(media),
            _ => None,
        };

        Ok(Self {
            article_id: article.id,
            expected_status: article.status,
            expected_version: article.version,
            next_status: next,
            featured_media,
            error,
        })
    }

    /// Whether `article` is still in the state this plan was made against.
    pub fn matches(&self, article: &Article) -> bool {
        article.id == self.article_id
            && article.status == self.expected_status
            && article.version == self.expected_version
    }

    /// Apply to an article already checked with [`matches`](Self::matches).
    pub fn apply_to(&self, article: &mut Article) {
        article.status = self.next_status;
        article.version += 1;
        if let Some(media) = &self.featured_media {
            article.featured_media = Some(media.clone());
        }
        if self.error.is_some() {
            article.last_error = self.error.clone();
        }
        article.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SourceId;
    use ArticleStatus::*;

    const MANUAL: AutomationFlags = AutomationFlags {
        auto_generate_image: false,
        auto_publish: false,
    };
    const IMAGE_ONLY: AutomationFlags = AutomationFlags {
        auto_generate_image: true,
        auto_publish: false,
    };
    const FULL_AUTO: AutomationFlags = AutomationFlags {
        auto_generate_image: true,
        auto_publish: true,
    };
    const PUBLISH_ONLY: AutomationFlags = AutomationFlags {
        auto_generate_image: false,
        auto_publish: true,
    };

    fn media() -> FeaturedMedia {
        FeaturedMedia {
            media_ref: "m-1".into(),
            url: Some("https://cdn.example.com/m-1.png".into()),
            alt_text: None,
        }
    }

    #[test]
    fn test_initial_status_selection() {
        assert_eq!(initial_status(MANUAL), Generated);
        assert_eq!(initial_status(IMAGE_ONLY), GeneratedImageDraft);
        assert_eq!(initial_status(FULL_AUTO), GeneratedImageDraft);
        assert_eq!(initial_status(PUBLISH_ONLY), ReadyToPublish);
    }

    #[test]
    fn test_manual_article_stays_generated_until_advanced() {
        let status = next_status(Draft, MANUAL, &StageResult::TextGenerated).unwrap();
        assert_eq!(status, Generated);

        // Automated stages do not apply to it.
        let err = next_status(status, MANUAL, &StageResult::ImageSucceeded { media: media() })
            .unwrap_err();
        assert!(matches!(err, TransitionError::Illegal { from: Generated, .. }));

        // A human approval moves it on.
        assert_eq!(
            next_status(status, MANUAL, &StageResult::ApprovedForPublish).unwrap(),
            ReadyToPublish
        );
    }

    #[test]
    fn test_full_auto_image_success_skips_with_image_state() {
        let next = next_status(
            GeneratedImageDraft,
            FULL_AUTO,
            &StageResult::ImageSucceeded { media: media() },
        )
        .unwrap();
        assert_eq!(next, ReadyToPublish);
    }

    #[test]
    fn test_image_success_without_auto_publish() {
        let next = next_status(
            GeneratedImageDraft,
            IMAGE_ONLY,
            &StageResult::ImageSucceeded { media: media() },
        )
        .unwrap();
        assert_eq!(next, GeneratedWithImage);
    }

    #[test]
    fn test_image_failure_goes_to_failed_not_back() {
        let next = next_status(
            GeneratedImageDraft,
            FULL_AUTO,
            &StageResult::ImageFailed {
                error: "provider timeout".into(),
            },
        )
        .unwrap();
        assert_eq!(next, Failed);
    }

    #[test]
    fn test_publish_failure_keeps_status_until_exhausted() {
        let retry = StageResult::PublishFailed {
            error: "503".into(),
            retries_exhausted: false,
        };
        assert_eq!(
            next_status(ReadyToPublish, FULL_AUTO, &retry).unwrap(),
            ReadyToPublish
        );

        let exhausted = StageResult::PublishFailed {
            error: "503".into(),
            retries_exhausted: true,
        };
        assert_eq!(
            next_status(ReadyToPublish, FULL_AUTO, &exhausted).unwrap(),
            Failed
        );
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for status in [Published, Failed] {
            let err = next_status(status, FULL_AUTO, &StageResult::Published).unwrap_err();
            assert_eq!(err, TransitionError::Terminal { status });
        }
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal_state() {
        for status in ArticleStatus::ALL.iter().copied().filter(|s| !s.is_terminal()) {
            let next = next_status(
                status,
                MANUAL,
                &StageResult::Abandoned {
                    reason: "operator".into(),
                },
            )
            .unwrap();
            assert_eq!(next, Failed);
        }
    }

    /// Walk every legal transition from every state and check no earlier
    /// non-failed status is ever revisited.
    #[test]
    fn test_status_monotonicity() {
        let results = [
            StageResult::TextGenerated,
            StageResult::TextGenerationFailed { error: "e".into() },
            StageResult::ImageRequested,
            StageResult::ImageSucceeded { media: media() },
            StageResult::ImageFailed { error: "e".into() },
            StageResult::ApprovedForPublish,
            StageResult::Published,
            StageResult::PublishFailed {
                error: "e".into(),
                retries_exhausted: false,
            },
        ];

        for flags in [MANUAL, IMAGE_ONLY, FULL_AUTO, PUBLISH_ONLY] {
            let mut frontier = vec![vec![Draft]];
            while let Some(path) = frontier.pop() {
                let current = *path.last().unwrap();
                for result in &results {
                    let Ok(next) = next_status(current, flags, result) else {
                        continue;
                    };
                    if next == current {
                        continue;
                    }
                    assert!(
                        !path.contains(&next) || next == Failed,
                        "{path:?} revisits {next}"
                    );
                    assert!(is_forward(current, next));
                    let mut extended = path.clone();
                    extended.push(next);
                    frontier.push(extended);
                }
            }
        }
    }

    #[test]
    fn test_plan_carries_media_and_version() {
        let article = Article::new(SourceId::new(), "t", "c", GeneratedImageDraft, FULL_AUTO);
        let plan =
            ArticleTransition::plan(&article, StageResult::ImageSucceeded { media: media() })
                .unwrap();

        assert_eq!(plan.expected_version, 0);
        assert_eq!(plan.next_status, ReadyToPublish);
        assert!(plan.matches(&article));

        let mut stored = article.clone();
        plan.apply_to(&mut stored);
        assert_eq!(stored.version, 1);
        assert_eq!(stored.featured_media, Some(media()));
        assert!(!plan.matches(&stored));
    }

    #[test]
    fn test_failure_plan_records_error_without_media() {
        let article = Article::new(SourceId::new(), "t", "c", GeneratedImageDraft, IMAGE_ONLY);
        let plan = ArticleTransition::plan(
            &article,
            StageResult::ImageFailed {
                error: "quota".into(),
            },
        )
        .unwrap();

        assert_eq!(plan.next_status, Failed);
        assert_eq!(plan.error.as_deref(), Some("quota"));
        assert_eq!(plan.featured_media, None);
    }

    #[test]
    fn test_status_wire_spelling() {
        let spelled: Vec<&str> = ArticleStatus::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            spelled,
            [
                "draft",
                "generated",
                "generated_image_draft",
                "generated_with_image",
                "ready_to_publish",
                "published",
                "failed"
            ]
        );
    }
}
