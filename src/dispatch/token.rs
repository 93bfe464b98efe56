//! Offer tokens and the action payloads that carry them.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::jobs::model::OfferAction;

/// Random bytes per token. 18 bytes encode to exactly 24 URL-safe chars.
const TOKEN_BYTES: usize = 18;

pub const TOKEN_LEN: usize = 24;

const ACCEPT_PREFIX: &str = "accept:";
const DECLINE_PREFIX: &str = "decline:";

/// Generate an unguessable offer token (144 bits from the OS RNG).
pub fn generate_offer_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `accept:<token>` / `decline:<token>`.
pub fn action_payload(action: OfferAction, token: &str) -> String {
    format!("{}:{token}", action.as_str())
}

/// Split an action payload back into its action and token.
///
/// Returns `None` for anything that is not a well-formed offer action.
pub fn parse_action_payload(data: &str) -> Option<(OfferAction, &str)> {
    let data = data.trim();
    let (action, token) = if let Some(token) = data.strip_prefix(ACCEPT_PREFIX) {
        (OfferAction::Accept, token)
    } else if let Some(token) = data.strip_prefix(DECLINE_PREFIX) {
        (OfferAction::Decline, token)
    } else {
        return None;
    };
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some((action, token))
}
