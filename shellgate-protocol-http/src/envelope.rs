use poem::http::StatusCode;
use poem::{IntoResponse, Response};
use serde::Serialize;
use shellgate_common::ShellgateError;

/// Uniform response envelope: `{success, data?, error?, meta?}`.
#[derive(Serialize)]
pub struct Envelope<T: Serialize + Send> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Serialize, Clone, Copy)]
pub struct Meta {
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub total_pages: u64,
}

impl Meta {
    pub fn new(page: u64, per_page: u64, total: u64) -> Self {
        Meta {
            page,
            per_page,
            total,
            total_pages: total.div_ceil(per_page.max(1)),
        }
    }
}

fn envelope_response<T: Serialize + Send>(status: StatusCode, envelope: Envelope<T>) -> Response {
    poem::web::Json(envelope).with_status(status).into_response()
}

pub fn api_ok<T: Serialize + Send>(data: T) -> Response {
    envelope_response(
        StatusCode::OK,
        Envelope {
            success: true,
            data: Some(data),
            error: None,
            meta: None,
        },
    )
}

pub fn api_ok_meta<T: Serialize + Send>(data: T, meta: Meta) -> Response {
    envelope_response(
        StatusCode::OK,
        Envelope {
            success: true,
            data: Some(data),
            error: None,
            meta: Some(meta),
        },
    )
}

pub fn api_created<T: Serialize + Send>(data: T) -> Response {
    envelope_response(
        StatusCode::CREATED,
        Envelope {
            success: true,
            data: Some(data),
            error: None,
            meta: None,
        },
    )
}

pub fn api_accepted<T: Serialize + Send>(data: T) -> Response {
    envelope_response(
        StatusCode::ACCEPTED,
        Envelope {
            success: true,
            data: Some(data),
            error: None,
            meta: None,
        },
    )
}

/// Maps any handler error into the envelope, keeping the stable code for
/// `ShellgateError` values.
pub fn error_response(error: poem::Error) -> Response {
    let status = error.status();
    let (code, message) = match error.downcast_ref::<ShellgateError>() {
        Some(e) => (e.code().to_owned(), e.to_string()),
        None => {
            let code = match status {
                StatusCode::NOT_FOUND => "not_found",
                StatusCode::BAD_REQUEST => "bad_request",
                StatusCode::UNAUTHORIZED => "unauthorized",
                StatusCode::FORBIDDEN => "forbidden",
                _ => "internal",
            };
            (code.to_owned(), error.to_string())
        }
    };
    envelope_response::<()>(
        status,
        Envelope {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code,
                message,
                details: None,
            }),
            meta: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_computes_total_pages() {
        let meta = Meta::new(0, 20, 45);
        assert_eq!(meta.total_pages, 3);
        let meta = Meta::new(0, 20, 40);
        assert_eq!(meta.total_pages, 2);
        let meta = Meta::new(0, 20, 0);
        assert_eq!(meta.total_pages, 0);
    }

    #[test]
    fn error_response_keeps_stable_code() {
        let error = poem::Error::from(ShellgateError::ActiveSessionExists);
        let response = error_response(error);
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
