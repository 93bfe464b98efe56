//! `Database` trait: the single async interface for dispatch persistence.
//!
//! Multi-row state changes that must never be observed half-applied
//! (accepting an offer, sweeping timeouts, direct assignment, cancelling,
//! completing with a review) are exposed as single trait methods so each
//! backend can run them as one atomic unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{
    Cleaner, DispatchAttempt, Job, JobStatus, Landlord, OfferStatus, Property, PropertyCleaner,
    Review,
};

/// Result of the atomic accept unit.
#[derive(Debug, Clone)]
pub enum AcceptResult {
    /// This attempt won. `cancelled` lists sibling offers that were still
    /// `sent` and have now been withdrawn.
    Accepted {
        job: Job,
        attempt: DispatchAttempt,
        cancelled: Vec<DispatchAttempt>,
    },
    /// The attempt was already resolved (response, timeout, or withdrawal).
    AttemptClosed { status: OfferStatus },
    /// The job was taken or is no longer dispatchable; this attempt has
    /// been marked `cancelled`.
    JobUnavailable { job: Job },
    /// No attempt with that id.
    AttemptMissing,
}

/// Result of the atomic direct-assignment unit.
#[derive(Debug, Clone)]
pub enum AssignResult {
    Assigned {
        job: Job,
        /// The accepted attempt, if one was created or promoted.
        attempt: Option<DispatchAttempt>,
        cancelled: Vec<DispatchAttempt>,
    },
    JobUnavailable { job: Job },
    JobMissing,
}

/// Result of the atomic cancellation unit.
#[derive(Debug, Clone)]
pub enum CancelResult {
    Cancelled {
        /// The job as it was before cancellation.
        previous: Job,
        /// Offers that were still `sent` and are now `cancelled`.
        withdrawn: Vec<DispatchAttempt>,
    },
    NotCancellable { status: JobStatus },
    JobMissing,
}

/// Result of the atomic deletion unit.
#[derive(Debug, Clone)]
pub enum DeleteResult {
    Deleted {
        /// The job as it was before deletion.
        job: Job,
        /// Offers that were still `sent` when the job went away.
        withdrawn: Vec<DispatchAttempt>,
    },
    JobMissing,
}

/// Backend-agnostic database trait for landlords, cleaners, jobs and offers.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Landlords & properties ──────────────────────────────────────

    async fn insert_landlord(&self, landlord: &Landlord) -> Result<(), DatabaseError>;

    async fn get_landlord(&self, id: Uuid) -> Result<Option<Landlord>, DatabaseError>;

    /// Store the landlord's chat address. Returns false if no such landlord.
    async fn set_landlord_chat_id(&self, id: Uuid, chat_id: &str) -> Result<bool, DatabaseError>;

    async fn insert_property(&self, property: &Property) -> Result<(), DatabaseError>;

    async fn get_property(&self, id: Uuid) -> Result<Option<Property>, DatabaseError>;

    // ── Cleaners ────────────────────────────────────────────────────

    async fn insert_cleaner(&self, cleaner: &Cleaner) -> Result<(), DatabaseError>;

    async fn get_cleaner(&self, id: Uuid) -> Result<Option<Cleaner>, DatabaseError>;

    /// Store the cleaner's chat address. Returns false if no such cleaner.
    async fn set_cleaner_chat_id(&self, id: Uuid, chat_id: &str) -> Result<bool, DatabaseError>;

    /// Overwrite name, chat address, notes and active flag. Returns false if
    /// no such cleaner.
    async fn update_cleaner(&self, cleaner: &Cleaner) -> Result<bool, DatabaseError>;

    /// Active cleaners of a landlord with a linked chat, alphabetical by name.
    async fn list_linked_cleaners(&self, landlord_id: Uuid) -> Result<Vec<Cleaner>, DatabaseError>;

    /// Add or replace a property ranking for a cleaner.
    async fn link_property_cleaner(&self, link: &PropertyCleaner) -> Result<(), DatabaseError>;

    /// Ranked cleaners of a property: primary first, then ascending priority.
    async fn list_property_cleaners(
        &self,
        property_id: Uuid,
    ) -> Result<Vec<(PropertyCleaner, Cleaner)>, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Jobs of a landlord ordered by window start.
    async fn list_jobs_by_landlord(&self, landlord_id: Uuid) -> Result<Vec<Job>, DatabaseError>;

    /// Change the window and booking reference of a job that is still
    /// `new` or `offered` with nobody assigned. Returns false otherwise.
    async fn reschedule_job(
        &self,
        id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        booking_ref: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Remove a job together with its attempts and review.
    async fn delete_job(&self, id: Uuid) -> Result<DeleteResult, DatabaseError>;

    /// Move a job to `offered` if it is still `new` or `offered`.
    /// Returns false if the job has moved on.
    async fn mark_job_offered(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Conditional status change: applies only when the current status is
    /// `from`. Returns whether a row changed.
    async fn transition_job(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, DatabaseError>;

    /// Accepted / in-progress jobs with an assignee, no reminder yet and a
    /// window starting in `(after, until]`.
    async fn list_jobs_needing_reminder(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Set the reminder marker if unset. Returns false if already set.
    async fn mark_reminder_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, DatabaseError>;

    // ── Dispatch attempts ───────────────────────────────────────────

    /// Insert a new attempt. A second attempt for the same (job, cleaner)
    /// pair fails with [`DatabaseError::Constraint`].
    async fn insert_attempt(&self, attempt: &DispatchAttempt) -> Result<(), DatabaseError>;

    /// Insert a `sent` attempt only while its job is still dispatchable
    /// (`new` or `offered`, nobody assigned). The check and the insert are
    /// one statement. Returns false if the job has moved on; a duplicate
    /// pair still fails with [`DatabaseError::Constraint`].
    async fn insert_offer_attempt(&self, attempt: &DispatchAttempt) -> Result<bool, DatabaseError>;

    async fn get_attempt(&self, id: Uuid) -> Result<Option<DispatchAttempt>, DatabaseError>;

    async fn get_attempt_by_token(
        &self,
        token: &str,
    ) -> Result<Option<DispatchAttempt>, DatabaseError>;

    /// All attempts for a job, oldest first.
    async fn list_attempts_for_job(&self, job_id: Uuid)
    -> Result<Vec<DispatchAttempt>, DatabaseError>;

    /// Resolve a `sent` attempt to a terminal status. Returns false when
    /// the attempt was no longer `sent` (someone else resolved it first).
    async fn close_attempt(
        &self,
        id: Uuid,
        status: OfferStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Atomic units ────────────────────────────────────────────────

    /// Accept an offer: job → accepted with assignee, attempt → accepted,
    /// sibling `sent` attempts → cancelled. All checks run inside the unit.
    async fn accept_offer(
        &self,
        attempt_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AcceptResult, DatabaseError>;

    /// Transition every `sent` attempt sent before `cutoff` to `timeout`.
    /// Returns the attempts that were swept.
    async fn timeout_stale_attempts(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DispatchAttempt>, DatabaseError>;

    /// Landlord override: assign `cleaner_id` without an offer round-trip.
    /// A live offer to that cleaner is promoted to `accepted`; if the pair
    /// has never been tried a new accepted attempt with `token` is written.
    async fn assign_directly(
        &self,
        job_id: Uuid,
        cleaner_id: Uuid,
        token: &str,
        at: DateTime<Utc>,
    ) -> Result<AssignResult, DatabaseError>;

    /// Cancel a non-terminal job, clear its assignee and withdraw live offers.
    async fn cancel_job(&self, job_id: Uuid, at: DateTime<Utc>)
    -> Result<CancelResult, DatabaseError>;

    /// Insert the review and move the job `done_awaiting_review → completed`.
    /// Returns false (nothing written) if the job is not awaiting review or
    /// already has a review.
    async fn complete_with_review(&self, review: &Review) -> Result<bool, DatabaseError>;

    async fn get_review_for_job(&self, job_id: Uuid) -> Result<Option<Review>, DatabaseError>;
}
