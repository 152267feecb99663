use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::fmt::Display;

pub(crate) fn plain_error(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("Error {}: {}\n", status.as_u16(), message),
    )
        .into_response()
}

pub fn bad_request(message: impl Into<String>) -> Response {
    plain_error(StatusCode::BAD_REQUEST, message)
}

pub fn internal_error(err: impl Display) -> Response {
    plain_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

pub fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}
