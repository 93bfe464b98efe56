//! Eligibility resolver: who gets the next offer for a job.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Cleaner, Job};
use crate::store::Database;

/// Picks the next candidate for a job.
///
/// Property rankings come first (primary, then ascending priority). When no
/// ranked cleaner is left, any active linked cleaner of the landlord is
/// used, alphabetically, so unconfigured landlords still make progress.
#[derive(Clone)]
pub struct EligibilityResolver {
    db: Arc<dyn Database>,
}

impl EligibilityResolver {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Highest-ranked eligible cleaner not in `already_tried`, or `None`.
    pub async fn next_candidate(
        &self,
        job: &Job,
        already_tried: &HashSet<Uuid>,
    ) -> Result<Option<Cleaner>, DatabaseError> {
        let ranked = self.db.list_property_cleaners(job.property_id).await?;
        if let Some((link, cleaner)) = ranked
            .into_iter()
            .find(|(_, c)| {
                c.landlord_id == job.landlord_id
                    && c.is_eligible()
                    && !already_tried.contains(&c.id)
            })
        {
            debug!(
                job_id = %job.id,
                cleaner_id = %cleaner.id,
                is_primary = link.is_primary,
                priority = link.priority,
                "Candidate from property ranking"
            );
            return Ok(Some(cleaner));
        }

        let fallback = self
            .db
            .list_linked_cleaners(job.landlord_id)
            .await?
            .into_iter()
            .find(|c| c.is_eligible() && !already_tried.contains(&c.id));

        match &fallback {
            Some(cleaner) => {
                debug!(job_id = %job.id, cleaner_id = %cleaner.id, "Candidate from landlord pool")
            }
            None => debug!(
                job_id = %job.id,
                tried = already_tried.len(),
                "No eligible cleaner left"
            ),
        }
        Ok(fallback)
    }
}
