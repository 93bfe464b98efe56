//! Dispatch engine: candidate selection, offers, responses and fallback.

pub mod eligibility;
pub mod messages;
pub mod notify;
pub mod offer;
pub mod orchestrator;
pub mod resolver;
pub mod token;

pub use eligibility::EligibilityResolver;
pub use notify::{Fallback, Notifier};
pub use offer::OfferManager;
pub use orchestrator::{DispatchOutcome, Dispatcher};
pub use resolver::{ResolveOutcome, ResponseResolver, SweepReport};
