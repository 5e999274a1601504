//! Error types shared by the HTTP assessment client.

use reqwest::StatusCode;
use thiserror::Error;

use crate::dao::api::ApiError;

/// Convenient result alias returning [`HttpApiError`] failures.
pub type HttpResult<T> = Result<T, HttpApiError>;

/// Failures that can occur while talking to the assessment server over HTTP.
#[derive(Debug, Error)]
pub enum HttpApiError {
    /// Required environment variable is missing.
    #[error("missing assessment API environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build assessment API client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// A request could not be sent or no response arrived.
    #[error("failed to send assessment API request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// The server returned a non-success status.
    #[error("unexpected assessment API status {status} for `{path}`")]
    RequestStatus { path: String, status: StatusCode },
    /// Response payload could not be parsed into JSON.
    #[error("failed to decode assessment API response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

impl From<HttpApiError> for ApiError {
    fn from(err: HttpApiError) -> Self {
        match err {
            HttpApiError::RequestStatus { status, .. } if status == StatusCode::FORBIDDEN => {
                ApiError::NotEligible
            }
            HttpApiError::RequestStatus { status, .. } if status == StatusCode::CONFLICT => {
                ApiError::AlreadyCompleted
            }
            HttpApiError::RequestStatus { status, .. } if status == StatusCode::GONE => {
                ApiError::AttemptExpired
            }
            HttpApiError::RequestStatus { path, status } => ApiError::Status {
                path,
                status: status.as_u16(),
            },
            HttpApiError::RequestSend { source, .. } if source.is_timeout() => ApiError::Timeout,
            HttpApiError::RequestSend { path, source } => {
                ApiError::Unreachable(format!("{path}: {source}"))
            }
            HttpApiError::DecodeResponse { path, source } => ApiError::Decode {
                path,
                message: source.to_string(),
            },
            other @ (HttpApiError::MissingEnvVar { .. } | HttpApiError::ClientBuilder { .. }) => {
                ApiError::Unreachable(other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: StatusCode) -> ApiError {
        HttpApiError::RequestStatus {
            path: "attempts/a1/answers/q1".into(),
            status: code,
        }
        .into()
    }

    #[test]
    fn rejection_statuses_map_to_authoritative_errors() {
        assert_eq!(status(StatusCode::FORBIDDEN), ApiError::NotEligible);
        assert_eq!(status(StatusCode::CONFLICT), ApiError::AlreadyCompleted);
        assert_eq!(status(StatusCode::GONE), ApiError::AttemptExpired);
    }

    #[test]
    fn other_statuses_stay_transient() {
        let err = status(StatusCode::BAD_GATEWAY);
        assert!(!err.is_authoritative());
        assert_eq!(
            err,
            ApiError::Status {
                path: "attempts/a1/answers/q1".into(),
                status: 502
            }
        );
    }

    #[test]
    fn missing_configuration_is_not_authoritative() {
        let err: ApiError = HttpApiError::MissingEnvVar {
            var: "EXAM_API_BASE_URL",
        }
        .into();
        assert!(!err.is_authoritative());
    }
}
