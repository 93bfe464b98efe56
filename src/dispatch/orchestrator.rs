//! Dispatch orchestrator: pick the next candidate and send the offer.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatch::eligibility::EligibilityResolver;
use crate::dispatch::offer::OfferManager;
use crate::error::{DatabaseError, DispatchError};
use crate::jobs::model::{Cleaner, DispatchAttempt, JobStatus};
use crate::store::Database;

/// Result of a dispatch call. Running out of cleaners is a normal outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Offered {
        attempt: DispatchAttempt,
        cleaner: Cleaner,
    },
    NoEligibleCleaner,
}

/// Stateless entry point for offering a job; every call re-derives which
/// cleaners were already tried from the stored attempts.
#[derive(Clone)]
pub struct Dispatcher {
    db: Arc<dyn Database>,
    eligibility: EligibilityResolver,
    offers: OfferManager,
}

impl Dispatcher {
    pub fn new(db: Arc<dyn Database>, eligibility: EligibilityResolver, offers: OfferManager) -> Self {
        Self {
            db,
            eligibility,
            offers,
        }
    }

    pub fn offers(&self) -> &OfferManager {
        &self.offers
    }

    /// Offer `job_id` to the next eligible cleaner.
    pub async fn dispatch(&self, job_id: Uuid) -> Result<DispatchOutcome, DispatchError> {
        let job = self
            .db
            .get_job(job_id)
            .await?
            .ok_or(DispatchError::JobNotFound { id: job_id })?;
        job.ensure_transition(JobStatus::Offered, "dispatch")?;

        let property = self
            .db
            .get_property(job.property_id)
            .await?
            .ok_or_else(|| {
                DispatchError::Validation(format!("Job {} has no property", job.id))
            })?;

        // Each pass either sends, stops, or loses a (job, cleaner) insert
        // race, after which that cleaner counts as tried; the candidate set
        // shrinks every time round.
        loop {
            let already_tried: HashSet<Uuid> = self
                .db
                .list_attempts_for_job(job.id)
                .await?
                .into_iter()
                .map(|a| a.cleaner_id)
                .collect();

            let Some(cleaner) = self.eligibility.next_candidate(&job, &already_tried).await? else {
                info!(job_id = %job.id, tried = already_tried.len(), "No eligible cleaner");
                return Ok(DispatchOutcome::NoEligibleCleaner);
            };

            match self.offers.send_offer(&job, &property, &cleaner).await {
                Ok(attempt) => return Ok(DispatchOutcome::Offered { attempt, cleaner }),
                Err(DispatchError::Database(DatabaseError::Constraint(reason))) => {
                    debug!(
                        job_id = %job.id,
                        cleaner_id = %cleaner.id,
                        %reason,
                        "Candidate claimed by a concurrent dispatch, reselecting"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MemoryChannel;
    use crate::jobs::model::{Job, Landlord, OfferStatus, Property, PropertyCleaner};
    use crate::store::LibSqlBackend;

    struct Fixture {
        db: Arc<dyn Database>,
        channel: Arc<MemoryChannel>,
        dispatcher: Dispatcher,
        landlord: Landlord,
        property: Property,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let channel = Arc::new(MemoryChannel::new());
        let landlord = Landlord::new("Lena");
        db.insert_landlord(&landlord).await.unwrap();
        let property = Property::new(landlord.id, "Loft");
        db.insert_property(&property).await.unwrap();
        let dispatcher = Dispatcher::new(
            db.clone(),
            EligibilityResolver::new(db.clone()),
            OfferManager::new(db.clone(), channel.clone(), 10),
        );
        Fixture {
            db,
            channel,
            dispatcher,
            landlord,
            property,
        }
    }

    async fn job(f: &Fixture) -> Job {
        let start = chrono::Utc::now() + chrono::Duration::days(1);
        let job = Job::new(
            f.landlord.id,
            f.property.id,
            start,
            start + chrono::Duration::hours(2),
        )
        .unwrap();
        f.db.insert_job(&job).await.unwrap();
        job
    }

    async fn ranked_cleaner(f: &Fixture, name: &str, chat: &str, priority: i64) -> Cleaner {
        let c = Cleaner::new(f.landlord.id, name).with_chat_id(chat);
        f.db.insert_cleaner(&c).await.unwrap();
        f.db.link_property_cleaner(&PropertyCleaner {
            property_id: f.property.id,
            cleaner_id: c.id,
            priority,
            is_primary: priority == 0,
        })
        .await
        .unwrap();
        c
    }

    #[tokio::test]
    async fn dispatch_unknown_job() {
        let f = fixture().await;
        let err = f.dispatcher.dispatch(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DispatchError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn no_eligible_cleaner_leaves_job_new() {
        let f = fixture().await;
        let j = job(&f).await;

        let outcome = f.dispatcher.dispatch(j.id).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::NoEligibleCleaner));
        assert_eq!(f.db.get_job(j.id).await.unwrap().unwrap().status, JobStatus::New);
        assert!(f.channel.sent().await.is_empty());
    }

    #[tokio::test]
    async fn successive_dispatches_never_repeat_a_cleaner() {
        let f = fixture().await;
        let a = ranked_cleaner(&f, "Ana", "1", 0).await;
        let b = ranked_cleaner(&f, "Ben", "2", 1).await;
        let j = job(&f).await;

        let mut offered = Vec::new();
        loop {
            match f.dispatcher.dispatch(j.id).await.unwrap() {
                DispatchOutcome::Offered { cleaner, .. } => offered.push(cleaner.id),
                DispatchOutcome::NoEligibleCleaner => break,
            }
        }
        assert_eq!(offered, vec![a.id, b.id]);
        assert_eq!(f.db.get_job(j.id).await.unwrap().unwrap().status, JobStatus::Offered);
    }

    #[tokio::test]
    async fn failed_send_still_counts_as_tried() {
        let f = fixture().await;
        let a = ranked_cleaner(&f, "Ana", "1", 0).await;
        let b = ranked_cleaner(&f, "Ben", "2", 1).await;
        let j = job(&f).await;
        f.channel.fail_address("1").await;

        let err = f.dispatcher.dispatch(j.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::Channel(_)));

        // Manual retry moves on to the next cleaner.
        let outcome = f.dispatcher.dispatch(j.id).await.unwrap();
        let DispatchOutcome::Offered { cleaner, .. } = outcome else {
            panic!("expected an offer");
        };
        assert_eq!(cleaner.id, b.id);

        let attempts = f.db.list_attempts_for_job(j.id).await.unwrap();
        let to_a = attempts.iter().find(|x| x.cleaner_id == a.id).unwrap();
        assert_eq!(to_a.status, OfferStatus::Cancelled);
    }

    #[tokio::test]
    async fn dispatch_rejects_assigned_job() {
        let f = fixture().await;
        let a = ranked_cleaner(&f, "Ana", "1", 0).await;
        let j = job(&f).await;
        f.db.assign_directly(j.id, a.id, "t", chrono::Utc::now())
            .await
            .unwrap();

        let err = f.dispatcher.dispatch(j.id).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidJobState {
                status: JobStatus::Accepted,
                ..
            }
        ));
    }
}
