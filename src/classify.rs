//! Payload-level response classification.
//!
//! The Trio firmware embeds error markers inside HTTP 200 bodies, so a 2xx
//! status is never sufficient evidence of success; every body is inspected
//! before any value is decoded. Classification is pure: no I/O, no retry
//! logic, just a verdict the executor and fetchers act on.

use serde_json::Value;

/// Verdict for one raw response or one embedded payload value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Decodable payload, no embedded error marker.
    Success,
    /// Worth retrying: device busy, rate-limited, or 5xx.
    Transient,
    /// Not worth retrying for this call.
    Permanent,
    /// Key structurally absent from this firmware. Not an error.
    Unsupported,
    /// Body could not be decoded. Permanent for this call, never fatal for
    /// the cycle.
    Malformed,
}

impl Classification {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Classification::Transient)
    }
}

/// Marker embedded in a single payload value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMarker {
    /// Hard device error for this command (`ERROR`).
    HardError,
    /// Device busy, try again later (`TRY_LATER`, `BUSY`).
    Busy,
    /// Command not implemented by this firmware (`NOT_SUPPORTED`).
    NotSupported,
}

const HARD_MARKERS: &[&str] = &["ERROR", "ERR"];
const BUSY_MARKERS: &[&str] = &["TRY_LATER", "BUSY", "SERVICE"];
const UNSUPPORTED_MARKERS: &[&str] = &["NOT_SUPPORTED", "NOT AVAILABLE", "UNSUPPORTED"];

/// Classify a raw response. Must be called even for 2xx statuses.
pub fn classify(status: u16, body: &str) -> Classification {
    if !(200..300).contains(&status) {
        return classify_status(status);
    }

    let parsed: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return Classification::Malformed,
    };

    let Value::Object(map) = &parsed else {
        // Scalar bodies do occur on per-key endpoints; they carry no marker
        // envelope, so the value itself decides.
        return match marker_of(&parsed) {
            Some(ValueMarker::HardError) => Classification::Permanent,
            Some(ValueMarker::Busy) => Classification::Transient,
            Some(ValueMarker::NotSupported) => Classification::Unsupported,
            None => Classification::Success,
        };
    };

    // Top-level error envelope despite a 200 status.
    if let Some(err) = map.get("error") {
        return match marker_of(err) {
            Some(ValueMarker::Busy) => Classification::Transient,
            Some(ValueMarker::NotSupported) => Classification::Unsupported,
            _ => Classification::Permanent,
        };
    }

    Classification::Success
}

/// Classify a bare HTTP status (used when no body is available).
pub fn classify_status(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Success,
        408 | 429 => Classification::Transient,
        s if s >= 500 => Classification::Transient,
        _ => Classification::Permanent,
    }
}

/// Inspect one payload value for an embedded marker. `None` means the value
/// is ordinary data.
pub fn marker_of(raw: &Value) -> Option<ValueMarker> {
    let s = raw.as_str()?.trim().to_ascii_uppercase();
    if HARD_MARKERS.contains(&s.as_str()) {
        return Some(ValueMarker::HardError);
    }
    if BUSY_MARKERS.contains(&s.as_str()) {
        return Some(ValueMarker::Busy);
    }
    if UNSUPPORTED_MARKERS.contains(&s.as_str()) {
        return Some(ValueMarker::NotSupported);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_status_with_clean_body_is_success() {
        let body = r#"{"getVOL": 12345, "getBAR": "4120"}"#;
        assert_eq!(classify(200, body), Classification::Success);
    }

    #[test]
    fn ok_status_is_not_sufficient_evidence_of_success() {
        // The device answers 200 with an error envelope.
        assert_eq!(
            classify(200, r#"{"error": "ERROR"}"#),
            Classification::Permanent
        );
        assert_eq!(
            classify(200, r#"{"error": "TRY_LATER"}"#),
            Classification::Transient
        );
    }

    #[test]
    fn undecodable_body_is_malformed() {
        assert_eq!(classify(200, "<html>boom</html>"), Classification::Malformed);
        assert_eq!(classify(200, ""), Classification::Malformed);
    }

    #[test]
    fn server_errors_and_rate_limits_are_transient() {
        for status in [500, 502, 503, 504, 429, 408] {
            assert_eq!(classify(status, ""), Classification::Transient, "status {status}");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 422] {
            assert_eq!(classify(status, ""), Classification::Permanent, "status {status}");
        }
    }

    #[test]
    fn scalar_error_body_is_permanent() {
        assert_eq!(classify(200, r#""ERROR""#), Classification::Permanent);
    }

    #[test]
    fn scalar_unsupported_body_routes_to_unsupported() {
        assert_eq!(classify(200, r#""NOT_SUPPORTED""#), Classification::Unsupported);
    }

    #[test]
    fn marker_detection_is_case_insensitive() {
        assert_eq!(marker_of(&json!("error")), Some(ValueMarker::HardError));
        assert_eq!(marker_of(&json!("try_later")), Some(ValueMarker::Busy));
        assert_eq!(marker_of(&json!("not_supported")), Some(ValueMarker::NotSupported));
    }

    #[test]
    fn ordinary_values_carry_no_marker() {
        assert_eq!(marker_of(&json!(42)), None);
        assert_eq!(marker_of(&json!("4120")), None);
        assert_eq!(marker_of(&json!("192.168.1.81")), None);
    }

    #[test]
    fn transient_is_the_only_retryable_verdict() {
        assert!(Classification::Transient.is_retryable());
        for c in [
            Classification::Success,
            Classification::Permanent,
            Classification::Unsupported,
            Classification::Malformed,
        ] {
            assert!(!c.is_retryable(), "{c:?}");
        }
    }
}
