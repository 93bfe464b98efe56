//! Cleaner Dispatch: offer routing between landlords and cleaners.

pub mod api;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod inbound;
pub mod jobs;
pub mod store;
