use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::ProvisionError;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://berth.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            details: None,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_details(mut self, details: Vec<FieldError>) -> Self {
        self.problem.details = Some(details);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.problem.retryable = retryable;
        self
    }
}

fn status_for(err: &ProvisionError) -> StatusCode {
    match err {
        ProvisionError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        ProvisionError::PlanNotFound { .. } | ProvisionError::EggNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        ProvisionError::PlanNotOwned { .. } => StatusCode::FORBIDDEN,
        ProvisionError::QuotaExceeded { .. }
        | ProvisionError::LocationIneligible { .. }
        | ProvisionError::LocationAtCapacity { .. }
        | ProvisionError::NoEligibleNode { .. }
        | ProvisionError::NoFreeAllocation { .. } => StatusCode::CONFLICT,
        ProvisionError::NoDockerImage { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ProvisionError::CreationServiceFailure(_) => StatusCode::BAD_GATEWAY,
        ProvisionError::Store(_) | ProvisionError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        let status = status_for(&err);
        // Infrastructure details stay in the logs.
        let detail = match &err {
            ProvisionError::Store(_) | ProvisionError::Internal(_) => {
                "an internal error occurred, please try again".to_string()
            }
            other => other.to_string(),
        };

        let mut api = Self::new(status, err.code(), detail).with_retryable(err.is_retryable());
        if let ProvisionError::InvalidInput { field, message } = &err {
            api = api.with_details(vec![FieldError {
                field: (*field).to_string(),
                message: message.clone(),
            }]);
        }
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
