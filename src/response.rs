use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// Envelope for every health server response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Response code, mirrors the HTTP status
    pub code: i32,
    pub msg: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T) -> Self {
        Self {
            code: ResponseCode::SUCCESS,
            msg: ResponseCode::get_message(ResponseCode::SUCCESS).to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: String) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg,
            data: None,
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        let status = match self.code {
            ResponseCode::SUCCESS => StatusCode::OK,
            ResponseCode::NOT_FOUND => StatusCode::NOT_FOUND,
            ResponseCode::SERVICE_UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(self)).into_response()
    }
}

/// Response code constants
pub struct ResponseCode;

impl ResponseCode {
    pub const SUCCESS: i32 = 200;
    pub const NOT_FOUND: i32 = 404;
    pub const INTERNAL_ERROR: i32 = 500;
    pub const SERVICE_UNAVAILABLE: i32 = 503;
}

impl ResponseCode {
    pub fn get_message(code: i32) -> &'static str {
        match code {
            Self::SUCCESS => "ok",
            Self::NOT_FOUND => "not found",
            Self::INTERNAL_ERROR => "internal error",
            Self::SERVICE_UNAVAILABLE => "upstream unavailable",
            _ => "unknown error",
        }
    }
}

#[macro_export]
macro_rules! ok_response {
    ($data:expr) => {
        $crate::response::ApiResponse::success($data)
    };
}
