//! Retry Controller: classifies upstream outcomes and decides whether the
//! relay pipeline should attempt another channel.
//!
//! The pipeline owns the actual retry loop (it needs to thread the
//! excluded-channel list and the captured request body through each
//! attempt); this module is the pure decision table plus the handful of
//! response-shaping helpers the final, exhausted attempt needs.

use axum::http::StatusCode;

use crate::health::FailureKind;

/// Outcome of classifying one attempt's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub should_retry: bool,
    pub failure_kind: Option<FailureKind>,
    /// The upstream HTTP status that drove this classification, if any
    /// (`None` for transport-level failures). Kept so the retry loop can
    /// tell, once attempts are exhausted, whether the last failure was a
    /// 429 worth rewriting into a group-saturated message.
    pub status: Option<StatusCode>,
}

impl Classification {
    fn success() -> Self {
        Classification { should_retry: false, failure_kind: None, status: None }
    }

    fn stop(kind: FailureKind, status: StatusCode) -> Self {
        Classification { should_retry: false, failure_kind: Some(kind), status: Some(status) }
    }

    fn retry(kind: FailureKind, status: StatusCode) -> Self {
        Classification { should_retry: true, failure_kind: Some(kind), status: Some(status) }
    }
}

/// Classifies a completed HTTP response from upstream.
///
/// - 2xx: success, no failure signal.
/// - 400: the client's request itself is malformed; retrying would repeat
///   the same error against a different channel, so we stop.
/// - 401/403: fatal (auth/billing) for the health monitor's sake — this
///   channel's credentials are what failed, so it gets disabled — but the
///   failure says nothing about whether a *different* channel would serve
///   the request, so the retry table still treats it as "other 4xx" and
///   spends another attempt elsewhere.
/// - 429/5xx: transient, retry against another channel.
/// - other 4xx: treated as upstream-specific rather than client-fault, so
///   still worth a shot against a different channel.
pub fn classify_response(status: StatusCode) -> Classification {
    if status.is_success() {
        return Classification::success();
    }
    if status == StatusCode::BAD_REQUEST {
        return Classification::stop(FailureKind::Transient, status);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Classification::retry(FailureKind::Fatal, status);
    }
    Classification::retry(FailureKind::Transient, status)
}

/// Classifies a transport-level failure (connect/timeout/TLS) — always
/// transient and always worth retrying against a different channel, since
/// it says nothing about whether the request itself was valid.
pub fn classify_transport_error() -> Classification {
    Classification { should_retry: true, failure_kind: Some(FailureKind::Transient), status: None }
}

/// A channel pinned via the admin `-<channel_id>` suffix is never
/// substituted, so any failure against it stops the pipeline outright
/// regardless of what `classify_response` would otherwise say — only the
/// failure-kind signal for the health monitor survives.
pub fn pin_overrides(classification: Classification) -> Classification {
    Classification { should_retry: false, ..classification }
}

/// Rewrites a plain upstream "too many requests" into a message that
/// reflects the fact every channel in the group was exhausted, since by
/// the time this is surfaced the retry loop has already tried every
/// available channel.
pub fn group_saturated_message(group: &str, model: &str) -> String {
    format!("all channels for group '{group}' and model '{model}' are rate limited or unavailable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_status_has_no_failure_signal() {
        let c = classify_response(StatusCode::OK);
        assert!(!c.should_retry);
        assert_eq!(c.failure_kind, None);
    }

    #[test]
    fn server_error_is_retried_as_transient() {
        let c = classify_response(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(c.should_retry);
        assert_eq!(c.failure_kind, Some(FailureKind::Transient));
    }

    #[test]
    fn too_many_requests_is_retried() {
        let c = classify_response(StatusCode::TOO_MANY_REQUESTS);
        assert!(c.should_retry);
    }

    #[test]
    fn unauthorized_is_fatal_but_still_retried_on_another_channel() {
        let c = classify_response(StatusCode::UNAUTHORIZED);
        assert!(c.should_retry);
        assert_eq!(c.failure_kind, Some(FailureKind::Fatal));
    }

    #[test]
    fn bad_request_stops_without_fatal_disable() {
        let c = classify_response(StatusCode::BAD_REQUEST);
        assert!(!c.should_retry);
        assert_eq!(c.failure_kind, Some(FailureKind::Transient));
    }

    #[test]
    fn other_4xx_is_retried_as_upstream_specific() {
        let c = classify_response(StatusCode::NOT_FOUND);
        assert!(c.should_retry);
        let c = classify_response(StatusCode::UNPROCESSABLE_ENTITY);
        assert!(c.should_retry);
    }

    #[test]
    fn pin_override_always_stops() {
        let c = pin_overrides(classify_response(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!c.should_retry);
    }

    #[test]
    fn classification_carries_the_triggering_status() {
        let c = classify_response(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(c.status, Some(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn transport_errors_carry_no_status() {
        assert_eq!(classify_transport_error().status, None);
    }

    #[test]
    fn group_saturated_message_names_group_and_model() {
        let msg = group_saturated_message("default", "gpt-4o-mini");
        assert!(msg.contains("default"));
        assert!(msg.contains("gpt-4o-mini"));
    }
}
