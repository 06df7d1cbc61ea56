use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::loans::LoanServiceError;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    pub fn bad_request<S: Into<String>>(detail: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", detail)
    }
}

impl From<LoanServiceError> for ProblemResponse {
    fn from(err: LoanServiceError) -> Self {
        let detail = err.to_string();
        match err {
            LoanServiceError::Validation(_) => Self::bad_request(detail),
            LoanServiceError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", detail),
            LoanServiceError::StateConflict(_) => {
                Self::new(StatusCode::CONFLICT, "state_conflict", detail)
            }
            LoanServiceError::FundingConflict => {
                Self::new(StatusCode::CONFLICT, "funding_conflict", detail)
            }
            LoanServiceError::Integrity { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "integrity_error", detail)
            }
            LoanServiceError::Repository(source) => {
                error!(stage = "app", error = %source, "repository failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error",
                )
            }
        }
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
