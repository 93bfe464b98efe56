//! Chat message texts (Telegram HTML subset).

use chrono::{DateTime, Utc};

pub const ACK_EXPIRED: &str = "This offer has expired or was already answered.";
pub const ACK_ALREADY_ANSWERED: &str = "Already answered.";
pub const ACK_TAKEN: &str = "This job was already taken by another cleaner.";
pub const ACK_ACCEPTED: &str = "Job accepted!";
pub const ACK_DECLINED: &str = "Declined.";
pub const ACK_FAILED: &str = "Something went wrong. Please try again or contact your landlord.";

pub const CLEANER_TAKEN: &str =
    "This job was already accepted by someone else. You'll get the next one.";
pub const CLEANER_ACCEPTED: &str =
    "✅ You accepted the job. We'll send a reminder before the cleaning window.";
pub const CLEANER_DECLINED: &str = "OK, we'll offer this job to someone else.";
pub const CLEANER_LOST_RACE: &str =
    "This order was accepted by another cleaner. You'll get the next one.";

pub const LINK_INVALID: &str = "This link is invalid or has expired.";
pub const LINK_HELP: &str =
    "Use the link from your landlord to link your Telegram to Cleaner Dispatch.";
pub const LINK_LANDLORD_OK: &str =
    "✅ You're linked. You'll receive job updates here (accepted, declined, cleaning completed).";
pub const LINK_FAILED: &str = "Something went wrong. Please try again from the dashboard.";

pub const ACCEPT_LABEL: &str = "✅ Accept";
pub const DECLINE_LABEL: &str = "❌ Decline";
pub const VIEW_JOB_LABEL: &str = "View job";
pub const REVIEW_LABEL: &str = "Review & rate";

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// `Oct 16, 2026 09:00 – 12:00 UTC`; the end carries its date when it falls
/// on another day.
pub fn format_window(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let end_fmt = if end.date_naive() == start.date_naive() {
        end.format("%H:%M")
    } else {
        end.format("%b %-d, %Y %H:%M")
    };
    format!("{} – {} UTC", start.format("%b %-d, %Y %H:%M"), end_fmt)
}

pub fn offer(
    property_name: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    response_minutes: i64,
) -> String {
    format!(
        "🧹 <b>Cleaning job</b>\n\n\
         Property: <b>{}</b>\n\
         Window: {}\n\n\
         Tap Accept to take this job, or Decline to pass.\n\
         You have about {response_minutes} minutes before we may offer this job to someone else.",
        escape_html(property_name),
        format_window(start, end),
    )
}

pub fn reminder(property_name: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "⏰ <b>Reminder: cleaning job coming up</b>\n\n\
         Property: <b>{}</b>\n\
         Window: {}\n\n\
         Please complete the cleaning and mark the job as done when finished.",
        escape_html(property_name),
        format_window(start, end),
    )
}

pub fn assigned(property_name: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "📌 <b>You've been assigned a cleaning job</b>\n\n\
         Property: <b>{}</b>\n\
         Window: {}",
        escape_html(property_name),
        format_window(start, end),
    )
}

pub fn offer_rescheduled(property_name: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "🗓 <b>Offer updated</b>\n\n\
         The job at <b>{}</b> now runs {}. Your Accept / Decline buttons still work.",
        escape_html(property_name),
        format_window(start, end),
    )
}

pub fn job_withdrawn(property_name: &str) -> String {
    format!(
        "🚫 The cleaning job at <b>{}</b> was cancelled by the landlord.",
        escape_html(property_name)
    )
}

pub fn cleaner_linked(name: &str) -> String {
    format!(
        "✅ You're linked as <b>{}</b>. You'll receive cleaning assignments here.",
        escape_html(name)
    )
}

pub fn landlord_accepted(property_name: &str, cleaner_name: &str) -> String {
    format!(
        "✅ <b>Job accepted</b>\n\n<b>{}</b> — {} has accepted. You're all set.",
        escape_html(property_name),
        escape_html(cleaner_name)
    )
}

pub fn landlord_declined(
    property_name: &str,
    cleaner_name: &str,
    next_cleaner: Option<&str>,
) -> String {
    let next_line = match next_cleaner {
        Some(next) => format!("We've offered the job to <b>{}</b>.", escape_html(next)),
        None => "No other cleaner available — please assign in the dashboard.".to_string(),
    };
    format!(
        "❌ <b>Job declined</b>\n\n<b>{}</b> — {} declined. {next_line}",
        escape_html(property_name),
        escape_html(cleaner_name)
    )
}

pub fn landlord_done(property_name: &str, cleaner_name: &str) -> String {
    format!(
        "🏠 <b>Cleaning completed</b>\n\n<b>{}</b> — {} marked the job as done. \
         Property is ready for the next guest. Please review and rate the cleaner.",
        escape_html(property_name),
        escape_html(cleaner_name)
    )
}
