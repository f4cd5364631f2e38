//! HTTP polling and response endpoints.
//!
//! | Method | Path        | Response                                   |
//! |--------|-------------|--------------------------------------------|
//! | GET    | `/messages` | `{"message": .., "id": ..}` or `{}`        |
//! | POST   | `/response` | `OK` on success, `400` on a malformed body |

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::console::Console;
use crate::slot::MessageSlot;

/// Shared state handed to every connection
#[derive(Clone)]
pub struct AppContext {
    pub slot: Arc<MessageSlot>,
    pub console: Console,
}

/// Body posted by the app to `/response`. Missing or null `response` reads as empty.
#[derive(Debug, Deserialize)]
pub struct ResponsePayload {
    #[serde(default)]
    response: Option<String>,
}

impl ResponsePayload {
    pub fn text(&self) -> &str {
        self.response.as_deref().unwrap_or_default()
    }
}

/// Failure to accept a posted response
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, got {0}")]
    NotObject(&'static str),
}

/// Route a request to its endpoint.
pub async fn handle<B>(req: Request<B>, ctx: AppContext) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/messages") => get_messages(&ctx),
        (&Method::POST, "/response") => post_response(req, &ctx).await,
        (_, "/messages") | (_, "/response") => {
            debug!(method = %req.method(), path = req.uri().path(), "Method not allowed");
            status_only(StatusCode::METHOD_NOT_ALLOWED)
        }
        _ => {
            debug!(path = req.uri().path(), "Unknown path");
            status_only(StatusCode::NOT_FOUND)
        }
    };
    Ok(response)
}

fn get_messages(ctx: &AppContext) -> Response<Full<Bytes>> {
    let body = match ctx.slot.get() {
        Some(message) => {
            info!(message = %message.message, id = %message.id, "App polled message");
            match serde_json::to_vec(&message) {
                Ok(json) => Bytes::from(json),
                Err(e) => {
                    warn!(error = %e, "Failed to encode message");
                    return status_only(StatusCode::INTERNAL_SERVER_ERROR);
                }
            }
        }
        None => Bytes::from_static(b"{}"),
    };

    let mut response = Response::new(Full::new(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

async fn post_response<B>(req: Request<B>, ctx: &AppContext) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    match read_payload(req).await {
        Ok(payload) => {
            ctx.console.app_says(payload.text());
            Response::new(Full::new(Bytes::from_static(b"OK")))
        }
        Err(e) => {
            warn!(error = %e, "Error handling response");
            status_only(StatusCode::BAD_REQUEST)
        }
    }
}

async fn read_payload<B>(req: Request<B>) -> Result<ResponsePayload, ResponseError>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| ResponseError::Body(e.to_string()))?
        .to_bytes();
    parse_payload(&body)
}

/// Decode a `/response` body. Only a JSON object is accepted; serde would
/// otherwise fill struct fields from a positional array.
fn parse_payload(body: &[u8]) -> Result<ResponsePayload, ResponseError> {
    let value: Value = serde_json::from_slice(body)?;
    let kind = match &value {
        Value::Object(_) => return Ok(serde_json::from_value(value)?),
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
    };
    Err(ResponseError::NotObject(kind))
}

fn status_only(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
