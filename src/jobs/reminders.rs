//! Reminder sweep for upcoming assigned jobs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dispatch::Notifier;
use crate::error::DispatchError;
use crate::store::Database;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    pub reminders_sent: usize,
    pub jobs_checked: usize,
}

#[derive(Clone)]
pub struct ReminderSweep {
    db: Arc<dyn Database>,
    notifier: Notifier,
    hours_ahead: i64,
}

impl ReminderSweep {
    pub fn new(db: Arc<dyn Database>, notifier: Notifier, hours_ahead: i64) -> Self {
        Self {
            db,
            notifier,
            hours_ahead,
        }
    }

    /// Remind the assignee of every accepted or in-progress job starting
    /// within the look-ahead that has not been reminded yet. A failure for
    /// one job leaves its marker unset so the next sweep retries it.
    pub async fn sweep_reminders(&self, now: DateTime<Utc>) -> Result<ReminderReport, DispatchError> {
        let until = now + Duration::hours(self.hours_ahead);
        let jobs = self.db.list_jobs_needing_reminder(now, until).await?;

        let mut report = ReminderReport {
            jobs_checked: jobs.len(),
            ..ReminderReport::default()
        };

        for job in jobs {
            if let Err(e) = self.notifier.send_reminder(&job).await {
                warn!(job_id = %job.id, error = %e, "Reminder not sent");
                continue;
            }
            match self.db.mark_reminder_sent(job.id, Utc::now()).await {
                Ok(true) => report.reminders_sent += 1,
                Ok(false) => debug!(job_id = %job.id, "Reminder marker already set"),
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to record reminder"),
            }
        }

        if report.jobs_checked > 0 {
            info!(
                reminders_sent = report.reminders_sent,
                jobs_checked = report.jobs_checked,
                "Reminder sweep finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MemoryChannel;
    use crate::jobs::model::{Cleaner, Job, Landlord, Property};
    use crate::store::LibSqlBackend;

    async fn assigned_job(
        db: &Arc<dyn Database>,
        landlord: &Landlord,
        property: &Property,
        cleaner: &Cleaner,
        starts_in: Duration,
    ) -> Job {
        let start = Utc::now() + starts_in;
        let job = Job::new(landlord.id, property.id, start, start + Duration::hours(2)).unwrap();
        db.insert_job(&job).await.unwrap();
        db.assign_directly(job.id, cleaner.id, &uuid::Uuid::new_v4().to_string(), Utc::now())
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn sweep_reminds_once_within_lookahead() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let channel = Arc::new(MemoryChannel::new());
        let landlord = Landlord::new("Lena");
        db.insert_landlord(&landlord).await.unwrap();
        let property = Property::new(landlord.id, "Loft");
        db.insert_property(&property).await.unwrap();
        let ana = Cleaner::new(landlord.id, "Ana").with_chat_id("1");
        db.insert_cleaner(&ana).await.unwrap();
        let mut unlinked = Cleaner::new(landlord.id, "Ben");
        unlinked.chat_id = None;
        db.insert_cleaner(&unlinked).await.unwrap();

        let soon = assigned_job(&db, &landlord, &property, &ana, Duration::hours(3)).await;
        assigned_job(&db, &landlord, &property, &ana, Duration::hours(48)).await;
        let unreachable =
            assigned_job(&db, &landlord, &property, &unlinked, Duration::hours(5)).await;

        let sweep = ReminderSweep::new(
            db.clone(),
            Notifier::new(db.clone(), channel.clone(), None),
            24,
        );
        let report = sweep.sweep_reminders(Utc::now()).await.unwrap();
        assert_eq!(
            report,
            ReminderReport {
                reminders_sent: 1,
                jobs_checked: 2
            }
        );
        assert_eq!(channel.sent_to("1").await.len(), 1);
        assert!(
            db.get_job(soon.id)
                .await
                .unwrap()
                .unwrap()
                .reminder_sent_at
                .is_some()
        );
        assert!(
            db.get_job(unreachable.id)
                .await
                .unwrap()
                .unwrap()
                .reminder_sent_at
                .is_none()
        );

        let again = sweep.sweep_reminders(Utc::now()).await.unwrap();
        assert_eq!(again.reminders_sent, 0);
        assert_eq!(again.jobs_checked, 1);
    }
}
