//! Job, cleaner and offer data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

/// Tags a landlord may attach to a review. Anything else is dropped.
pub const REVIEW_TAGS: &[&str] = &[
    "late",
    "low_quality",
    "missing_photos",
    "communication",
    "excellent",
];

/// Maximum stored length of a review comment, in characters.
pub const MAX_REVIEW_COMMENT_CHARS: usize = 2000;

/// Lifecycle status of a cleaning job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, no live offer yet (or no eligible cleaner found).
    New,
    /// At least one offer has been sent.
    Offered,
    /// A cleaner holds the job.
    Accepted,
    /// The assigned cleaner has started.
    InProgress,
    /// Cleaner reported done, landlord has not reviewed yet.
    DoneAwaitingReview,
    /// Reviewed and closed.
    Completed,
    /// Withdrawn by the landlord.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        Self::New,
        Self::Offered,
        Self::Accepted,
        Self::InProgress,
        Self::DoneAwaitingReview,
        Self::Completed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Offered => "offered",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::DoneAwaitingReview => "done_awaiting_review",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Offers may only be sent while the job is unassigned.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::New | Self::Offered)
    }

    /// Statuses in which `assigned_cleaner_id` must be set.
    pub fn requires_assignee(&self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::InProgress | Self::DoneAwaitingReview | Self::Completed
        )
    }

    /// Whether `self -> next` is a sanctioned transition.
    ///
    /// `Offered -> Offered` is allowed so re-dispatch after a decline or
    /// timeout stays idempotent. Nothing ever moves back to `New`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (New, Offered) | (Offered, Offered) => true,
            (New, Accepted) | (Offered, Accepted) => true,
            (Accepted, InProgress) => true,
            (Accepted, DoneAwaitingReview) | (InProgress, DoneAwaitingReview) => true,
            (DoneAwaitingReview, Completed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Unknown job status: {s}"))
    }
}

/// Status of a single offer (dispatch attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    /// Delivered, waiting for the cleaner.
    Sent,
    Accepted,
    Declined,
    /// No answer within the response window.
    Timeout,
    /// Withdrawn: lost the race, send failed, or the job was cancelled.
    Cancelled,
}

impl OfferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Sent)
    }
}

impl std::fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OfferStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "accepted" => Ok(Self::Accepted),
            "declined" => Ok(Self::Declined),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown offer status: {s}")),
        }
    }
}

/// What a cleaner chose on an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferAction {
    Accept,
    Decline,
}

impl OfferAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
        }
    }
}

/// A property manager who owns properties, cleaners and jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Landlord {
    pub id: Uuid,
    pub name: String,
    /// Chat address for job notifications. `None` until linked.
    pub chat_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Landlord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            chat_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A rental property that needs cleaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub id: Uuid,
    pub landlord_id: Uuid,
    pub name: String,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Property {
    pub fn new(landlord_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            landlord_id,
            name: name.into(),
            address: None,
            created_at: Utc::now(),
        }
    }
}

/// A cleaner who can receive offers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cleaner {
    pub id: Uuid,
    pub landlord_id: Uuid,
    pub name: String,
    /// Notification address. `None` means the cleaner has not linked a chat.
    pub chat_id: Option<String>,
    pub active: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Cleaner {
    pub fn new(landlord_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            landlord_id,
            name: name.into(),
            chat_id: None,
            active: true,
            notes: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    /// The linked chat address, ignoring blank values.
    pub fn linked_chat(&self) -> Option<&str> {
        self.chat_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Active and reachable.
    pub fn is_eligible(&self) -> bool {
        self.active && self.linked_chat().is_some()
    }
}

/// Ranking of a cleaner for one property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyCleaner {
    pub property_id: Uuid,
    pub cleaner_id: Uuid,
    /// Lower is tried first (after the primary).
    pub priority: i64,
    pub is_primary: bool,
}

/// A cleaning job tied to a property and a time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub property_id: Uuid,
    pub landlord_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: JobStatus,
    pub assigned_cleaner_id: Option<Uuid>,
    pub reminder_sent_at: Option<DateTime<Utc>>,
    /// External booking reference (e.g. from an imported reservation).
    pub booking_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a new job in status `new`. The window must be non-empty.
    pub fn new(
        landlord_id: Uuid,
        property_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Self, DispatchError> {
        if window_end <= window_start {
            return Err(DispatchError::Validation(
                "Window end must be after window start".into(),
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            property_id,
            landlord_id,
            window_start,
            window_end,
            status: JobStatus::New,
            assigned_cleaner_id: None,
            reminder_sent_at: None,
            booking_ref: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_booking_ref(mut self, booking_ref: impl Into<String>) -> Self {
        self.booking_ref = Some(booking_ref.into());
        self
    }

    /// Fail with `InvalidJobState` unless `self.status -> next` is allowed.
    pub fn ensure_transition(&self, next: JobStatus, operation: &str) -> Result<(), DispatchError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DispatchError::InvalidJobState {
                id: self.id,
                status: self.status,
                operation: operation.to_string(),
            })
        }
    }
}

/// One outbound offer for one (job, cleaner) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub id: Uuid,
    pub job_id: Uuid,
    pub cleaner_id: Uuid,
    /// Opaque token carried by the offer's action buttons.
    pub offer_token: String,
    pub status: OfferStatus,
    pub sent_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl DispatchAttempt {
    /// A freshly sent offer.
    pub fn new_sent(job_id: Uuid, cleaner_id: Uuid, offer_token: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            cleaner_id,
            offer_token,
            status: OfferStatus::Sent,
            sent_at: Utc::now(),
            responded_at: None,
        }
    }
}

/// Landlord's rating of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: Uuid,
    pub job_id: Uuid,
    pub cleaner_id: Uuid,
    pub rating: u8,
    pub tags: Vec<String>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Review {
    /// Validate and normalize a review. Unknown tags are dropped, the
    /// comment is trimmed and truncated.
    pub fn new(
        job_id: Uuid,
        cleaner_id: Uuid,
        rating: i64,
        tags: &[String],
        comment: Option<&str>,
    ) -> Result<Self, DispatchError> {
        if !(1..=5).contains(&rating) {
            return Err(DispatchError::Validation("Rating must be 1-5".into()));
        }
        let mut kept: Vec<String> = Vec::new();
        for tag in tags {
            if REVIEW_TAGS.contains(&tag.as_str()) && !kept.contains(tag) {
                kept.push(tag.clone());
            }
        }
        let comment = comment
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| c.chars().take(MAX_REVIEW_COMMENT_CHARS).collect());

        Ok(Self {
            id: Uuid::new_v4(),
            job_id,
            cleaner_id,
            rating: rating as u8,
            tags: kept,
            comment,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_roundtrip_strings() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn offered_never_returns_to_new() {
        for status in JobStatus::ALL {
            assert!(!status.can_transition_to(JobStatus::New), "{status} -> new");
        }
    }

    #[test]
    fn cancel_only_from_non_terminal() {
        assert!(JobStatus::New.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::DoneAwaitingReview.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn forward_chain_is_allowed() {
        assert!(JobStatus::New.can_transition_to(JobStatus::Offered));
        assert!(JobStatus::Offered.can_transition_to(JobStatus::Offered));
        assert!(JobStatus::Offered.can_transition_to(JobStatus::Accepted));
        assert!(JobStatus::Accepted.can_transition_to(JobStatus::InProgress));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::DoneAwaitingReview));
        assert!(JobStatus::DoneAwaitingReview.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Accepted.can_transition_to(JobStatus::Offered));
        assert!(!JobStatus::New.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn assignee_statuses() {
        let with: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(JobStatus::requires_assignee)
            .collect();
        assert_eq!(
            with,
            vec![
                JobStatus::Accepted,
                JobStatus::InProgress,
                JobStatus::DoneAwaitingReview,
                JobStatus::Completed
            ]
        );
    }

    #[test]
    fn job_rejects_empty_window() {
        let start = Utc::now();
        let err = Job::new(Uuid::new_v4(), Uuid::new_v4(), start, start).unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[test]
    fn cleaner_eligibility_requires_active_and_linked() {
        let landlord = Uuid::new_v4();
        let unlinked = Cleaner::new(landlord, "Ana");
        assert!(!unlinked.is_eligible());

        let blank = Cleaner::new(landlord, "Ben").with_chat_id("   ");
        assert!(!blank.is_eligible());

        let mut inactive = Cleaner::new(landlord, "Cy").with_chat_id("42");
        inactive.active = false;
        assert!(!inactive.is_eligible());

        assert!(Cleaner::new(landlord, "Di").with_chat_id("42").is_eligible());
    }

    #[test]
    fn review_filters_tags_and_trims_comment() {
        let tags = vec![
            "late".to_string(),
            "made_up".to_string(),
            "late".to_string(),
            "excellent".to_string(),
        ];
        let long = "x".repeat(MAX_REVIEW_COMMENT_CHARS + 50);
        let review = Review::new(Uuid::new_v4(), Uuid::new_v4(), 4, &tags, Some(&long)).unwrap();
        assert_eq!(review.tags, vec!["late", "excellent"]);
        assert_eq!(review.comment.unwrap().chars().count(), MAX_REVIEW_COMMENT_CHARS);

        let blank = Review::new(Uuid::new_v4(), Uuid::new_v4(), 1, &[], Some("  ")).unwrap();
        assert!(blank.comment.is_none());
    }

    #[test]
    fn review_rating_bounds() {
        assert!(Review::new(Uuid::new_v4(), Uuid::new_v4(), 0, &[], None).is_err());
        assert!(Review::new(Uuid::new_v4(), Uuid::new_v4(), 6, &[], None).is_err());
        assert!(Review::new(Uuid::new_v4(), Uuid::new_v4(), 5, &[], None).is_ok());
    }
}
