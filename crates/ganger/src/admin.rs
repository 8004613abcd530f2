//! Administrative control-plane messages: classification, privilege, and
//! construction.
//!
//! Kind detection and privilege detection are independent: an unprivileged
//! stop request still classifies as a stop request, so the runtime can
//! ignore it deliberately instead of mistaking it for application data.

use ganger_wire::{Message, WireError};

use crate::error::Result;
use crate::status::WorkerStatus;

/// Privilege is granted iff a cookie is configured AND the carried cookie
/// string-equals it. No configured cookie means never privileged.
fn privileged(carried: Option<&str>, configured: Option<&str>) -> bool {
    match (carried, configured) {
        (Some(carried), Some(configured)) => carried == configured,
        _ => false,
    }
}

/// `Some(privileged)` when the message is a stop request.
pub fn stop_request(message: &Message, cookie: Option<&str>) -> Option<bool> {
    match message {
        Message::Stop { cookie: carried } => Some(privileged(carried.as_deref(), cookie)),
        _ => None,
    }
}

/// `Some(privileged)` when the message is a query request.
pub fn query_request(message: &Message, cookie: Option<&str>) -> Option<bool> {
    match message {
        Message::Query { cookie: carried } => Some(privileged(carried.as_deref(), cookie)),
        _ => None,
    }
}

/// The decoded status payload, or `None` for anything that is not a
/// well-formed status reply.
pub fn status_reply(message: &Message) -> Option<WorkerStatus> {
    match message {
        Message::Status { status } => WorkerStatus::from_value(status),
        _ => None,
    }
}

pub fn stop_message(cookie: Option<&str>) -> Message {
    Message::stop(cookie.map(str::to_owned))
}

pub fn query_message(cookie: Option<&str>) -> Message {
    Message::query(cookie.map(str::to_owned))
}

pub fn status_message(status: &WorkerStatus) -> Result<Message> {
    let value = serde_json::to_value(status).map_err(WireError::Malformed)?;
    Ok(Message::status(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_configured_cookie_never_grants_privilege() {
        let message = stop_message(Some("anything"));
        assert_eq!(stop_request(&message, None), Some(false));
    }

    #[test]
    fn test_privilege_requires_exact_match() {
        let message = stop_message(Some("secret"));
        assert_eq!(stop_request(&message, Some("secret")), Some(true));
        assert_eq!(stop_request(&message, Some("Secret")), Some(false));

        let anonymous = stop_message(None);
        assert_eq!(stop_request(&anonymous, Some("secret")), Some(false));
    }

    #[test]
    fn test_kind_detection_is_independent_of_privilege() {
        let message = query_message(Some("wrong"));
        assert_eq!(query_request(&message, Some("right")), Some(false));
        assert_eq!(stop_request(&message, Some("right")), None);
    }

    #[test]
    fn test_status_reply_decodes_payload() {
        let status = WorkerStatus::from("ready");
        let message = status_message(&status).expect("status message");
        assert_eq!(status_reply(&message), Some(status));

        let data = Message::data(serde_json::json!({ "x": 1 }));
        assert_eq!(status_reply(&data), None);
    }
}
