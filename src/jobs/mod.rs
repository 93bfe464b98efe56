//! Jobs: domain model, lifecycle operations and reminders.

pub mod lifecycle;
pub mod model;
pub mod reminders;

pub use lifecycle::{CreatedJob, JobEdit, JobLifecycle, NewJob};
pub use model::{
    Cleaner, DispatchAttempt, Job, JobStatus, Landlord, OfferAction, OfferStatus, Property,
    PropertyCleaner, Review,
};
pub use reminders::{ReminderReport, ReminderSweep};
