use serde::Deserialize;

/// Fallback text shown when a failed request carries no readable message.
pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong. Please try again.";

/// Failures a caller needs to tell apart.
///
/// Functions in this crate return `anyhow::Result`; when the kind of failure
/// matters (not found vs. unreachable vs. cancelled) the error wraps one of
/// these and callers use `downcast_ref::<ApiError>()`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("could not reach the server: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("session expired, please log in again")]
    Unauthorized,
    #[error("server returned {status}{}", suffix(.message))]
    Status {
        status: u16,
        message: Option<String>,
    },
    #[error("server reported a failure: {0}")]
    Backend(String),
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
    #[error("{what} not found{}", suffix(.message))]
    NotFound {
        what: String,
        message: Option<String>,
    },
    #[error("request aborted")]
    Aborted,
}

impl ApiError {
    /// Message suitable for an inline alert: the server-provided text when
    /// there is one, otherwise the generic fallback.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Status {
                message: Some(m), ..
            }
            | ApiError::NotFound {
                message: Some(m), ..
            }
            | ApiError::Backend(m) => m.clone(),
            ApiError::Unauthorized => self.to_string(),
            _ => GENERIC_ERROR_MESSAGE.to_string(),
        }
    }

    /// A missing record with no server-provided message.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        ApiError::NotFound {
            what: what.into(),
            message: None,
        }
    }

    /// Build a `Status` error from a non-success response body, pulling the
    /// message out of `detail` or `message` when the body is JSON.
    #[must_use]
    pub fn from_status_body(status: u16, body: &str) -> Self {
        if status == 401 {
            return ApiError::Unauthorized;
        }
        ApiError::Status {
            status,
            message: error_body_message(body),
        }
    }
}

fn suffix(message: &Option<String>) -> String {
    message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
    message: Option<String>,
}

/// Extract `detail` (string form only) or `message` from an error body.
#[must_use]
pub fn error_body_message(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let detail = parsed.detail.and_then(|d| match d {
        serde_json::Value::String(s) => Some(s),
        _ => None,
    });
    detail
        .or(parsed.message)
        .filter(|m| !m.trim().is_empty())
}

/// True when `err` (or anything it wraps) is the given classification.
#[must_use]
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ApiError>(), Some(ApiError::NotFound { .. }))
}

#[must_use]
pub fn is_aborted(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ApiError>(), Some(ApiError::Aborted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_prefers_detail() {
        let body = r#"{"detail":"Plan name taken","message":"other"}"#;
        assert_eq!(error_body_message(body).as_deref(), Some("Plan name taken"));
    }

    #[test]
    fn test_error_body_falls_back_to_message() {
        let body = r#"{"success":false,"message":"Chatbot offline"}"#;
        assert_eq!(error_body_message(body).as_deref(), Some("Chatbot offline"));
    }

    #[test]
    fn test_error_body_ignores_structured_detail() {
        // FastAPI validation errors put a list in `detail`
        let body = r#"{"detail":[{"loc":["body","name"],"msg":"field required"}]}"#;
        assert!(error_body_message(body).is_none());
    }

    #[test]
    fn test_error_body_not_json() {
        assert!(error_body_message("<html>502</html>").is_none());
    }

    #[test]
    fn test_user_message_fallback() {
        let err = ApiError::from_status_body(500, "");
        assert_eq!(err.user_message(), GENERIC_ERROR_MESSAGE);

        let err = ApiError::from_status_body(400, r#"{"detail":"bad input"}"#);
        assert_eq!(err.user_message(), "bad input");
    }

    #[test]
    fn test_not_found_keeps_server_detail() {
        let err = ApiError::NotFound {
            what: "/api/nutrition/meal-plans/7".into(),
            message: error_body_message(r#"{"detail":"Meal plan 7 was deleted"}"#),
        };
        assert_eq!(err.user_message(), "Meal plan 7 was deleted");
        assert_eq!(
            err.to_string(),
            "/api/nutrition/meal-plans/7 not found: Meal plan 7 was deleted"
        );

        assert_eq!(
            ApiError::not_found("meal plan 7").user_message(),
            GENERIC_ERROR_MESSAGE
        );
    }

    #[test]
    fn test_401_is_unauthorized() {
        assert!(matches!(
            ApiError::from_status_body(401, r#"{"detail":"expired"}"#),
            ApiError::Unauthorized
        ));
    }

    #[test]
    fn test_downcast_helpers() {
        let err = anyhow::Error::new(ApiError::not_found("meal plan local-1"));
        assert!(is_not_found(&err));
        assert!(!is_aborted(&err));

        let wrapped = anyhow::Error::new(ApiError::Aborted).context("streaming reply");
        assert!(is_aborted(&wrapped));
    }
}
