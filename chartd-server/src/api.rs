//! HTTP binding of the service façade.
//!
//! Routes live under `/api/v1`. Instance ids are `<definition>/<id>`, which
//! maps directly onto the path. `GET .../_changes` streams notifications as
//! Server-Sent Events until the client disconnects or the instance is
//! deleted.

use crate::broadcast::{Notification, NotificationReceiver};
use crate::error::{ErrorKind, ServiceError};
use crate::models::ModelSource;
use crate::service::Service;
use bytes::Bytes;
use chartd_core::Event;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// Response body type for every route.
pub type ApiBody = BoxBody<Bytes, Infallible>;

const API_PREFIX: &str = "/api/v1";

const ARCHIVE_CONTENT_TYPES: &[&str] = &[
    "application/x-tar",
    "application/gzip",
    "application/x-gzip",
    "application/tar+gzip",
];

/// Header carrying the subscription handle of an SSE response.
pub const SUBSCRIPTION_HEADER: &str = "x-subscription-id";

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Health,
    Metrics,
    Definitions,
    Definition(&'a str),
    AllInstances(&'a str),
    Instance(&'a str, &'a str),
    Changes(&'a str, &'a str),
    PendingSend(&'a str, &'a str, &'a str),
    Unknown,
}

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Self {
        match path {
            "/health" | "/healthz" => return Route::Health,
            "/metrics" => return Route::Metrics,
            _ => {}
        }

        let Some(rest) = path.strip_prefix(API_PREFIX) else {
            return Route::Unknown;
        };
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [] => Route::Definitions,
            [def] => Route::Definition(def),
            [def, "_all_instances"] => Route::AllInstances(def),
            [def, id] => Route::Instance(def, id),
            [def, id, "_changes"] => Route::Changes(def, id),
            [def, id, "_sends", sendid] => Route::PendingSend(def, id, sendid),
            _ => Route::Unknown,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CreateInstanceRequest {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

/// Maps an error kind to its HTTP status.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Compile | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Extract => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InstanceExists | ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn full(bytes: impl Into<Bytes>) -> ApiBody {
    Full::new(bytes.into()).boxed()
}

fn with_status(status: StatusCode, content_type: &'static str, body: ApiBody) -> Response<ApiBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ApiBody> {
    match serde_json::to_vec(value) {
        Ok(body) => with_status(status, "application/json", full(body)),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            e.to_string(),
        ),
    }
}

fn error_response(status: StatusCode, code: &str, message: String) -> Response<ApiBody> {
    let body = json!({ "error": ErrorBody { code, message } });
    with_status(status, "application/json", full(body.to_string()))
}

fn instance_id(def: &str, id: &str) -> String {
    format!("{}/{}", def, id)
}

async fn read_body<B>(body: B) -> Result<Bytes, ServiceError>
where
    B: Body,
    B::Error: Display,
{
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ServiceError::InvalidRequest(format!("failed to read body: {}", e)))
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Streams one subscriber's notifications as SSE frames. Dropping the body
/// removes the subscriber.
pub struct SseBody {
    receiver: NotificationReceiver,
    _guard: SubscriptionGuard,
}

struct SubscriptionGuard {
    service: Arc<Service>,
    instance_id: String,
    handle: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.service.unsubscribe(&self.instance_id, &self.handle) {
            tracing::debug!("{} disconnected from {}", self.handle, self.instance_id);
        }
    }
}

/// Formats one notification as an SSE event.
pub fn encode_sse(notification: &Notification) -> Bytes {
    let data = serde_json::to_string(notification).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: {}\ndata: {}\n\n", notification.kind(), data))
}

impl Body for SseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        self.receiver
            .poll_recv(cx)
            .map(|next| next.map(|n| Ok(Frame::data(encode_sse(&n)))))
    }
}

/// HTTP front end over a [`Service`].
#[derive(Clone)]
pub struct Api {
    service: Arc<Service>,
    metrics_enabled: bool,
}

impl Api {
    pub fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            metrics_enabled: false,
        }
    }

    /// Serves `/metrics` when enabled.
    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Handles one request. Never fails; errors become JSON responses.
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<ApiBody>, Infallible>
    where
        B: Body,
        B::Error: Display,
    {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let route = Route::parse(&path);
        let operation = operation_name(&method, &route);

        let metrics = self.service.metrics();
        metrics.requests_total.with_label_values(&[operation]).inc();

        let response = match self.dispatch(req, &method, &route).await {
            Ok(response) => response,
            Err(e) => {
                metrics.errors_total.with_label_values(&[e.error_code()]).inc();
                if e.kind() == ErrorKind::Internal {
                    tracing::error!("{} {} failed: {}", method, path, e);
                } else {
                    tracing::debug!("{} {} failed: {}", method, path, e);
                }
                error_response(status_for(e.kind()), e.error_code(), e.to_string())
            }
        };

        metrics
            .request_duration
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
        tracing::debug!("{} {} -> {}", method, path, response.status());
        Ok(response)
    }

    async fn dispatch<B>(
        &self,
        req: Request<B>,
        method: &Method,
        route: &Route<'_>,
    ) -> Result<Response<ApiBody>, ServiceError>
    where
        B: Body,
        B::Error: Display,
    {
        let service = &self.service;
        match (method, route) {
            (&Method::GET, Route::Health) => {
                Ok(with_status(StatusCode::OK, "text/plain", full("OK")))
            }
            (&Method::GET, Route::Metrics) if self.metrics_enabled => Ok(with_status(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                full(service.metrics().encode()),
            )),

            (&Method::GET, Route::Definitions) => {
                Ok(json_response(StatusCode::OK, &service.list_definitions()))
            }
            (&Method::PUT, Route::Definition(def)) => {
                let content_type = req
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase());
                let url = query_param(req.uri().query(), "url");
                let body = read_body(req.into_body()).await?;

                let source = if let Some(url) = url {
                    ModelSource::Url(url)
                } else if content_type
                    .as_deref()
                    .map_or(false, |ct| ARCHIVE_CONTENT_TYPES.contains(&ct))
                    || chartd_storage::is_gzip(&body)
                {
                    ModelSource::Archive(body)
                } else if body.is_empty() {
                    ModelSource::Store
                } else {
                    ModelSource::Document(body)
                };

                let info = service.create_definition(def, source).await?;
                Ok(json_response(StatusCode::CREATED, &info))
            }
            (&Method::GET, Route::Definition(def)) => {
                Ok(json_response(StatusCode::OK, &service.get_definition(def)?))
            }
            (&Method::DELETE, Route::Definition(def)) => {
                service.delete_definition(def).await?;
                Ok(json_response(StatusCode::OK, &json!({ "deleted": def })))
            }
            (&Method::POST, Route::Definition(def)) => {
                let body = read_body(req.into_body()).await?;
                let request: CreateInstanceRequest = if body.is_empty() {
                    CreateInstanceRequest::default()
                } else {
                    serde_json::from_slice(&body)?
                };
                let id = service.create_instance(def, request.id.as_deref())?;
                Ok(json_response(StatusCode::CREATED, &json!({ "id": id })))
            }
            (&Method::GET, Route::AllInstances(def)) => {
                service.get_definition(def)?;
                Ok(json_response(StatusCode::OK, &service.list_instances(Some(*def))))
            }

            (&Method::GET, Route::Instance(def, id)) => {
                let configuration = service.get_snapshot(&instance_id(def, id))?;
                Ok(json_response(StatusCode::OK, &configuration))
            }
            (&Method::POST, Route::Instance(def, id)) => {
                let body = read_body(req.into_body()).await?;
                let event: Event = serde_json::from_slice(&body)?;
                let configuration = service.send_event(&instance_id(def, id), &event)?;
                Ok(json_response(StatusCode::OK, &configuration))
            }
            (&Method::DELETE, Route::Instance(def, id)) => {
                let id = instance_id(def, id);
                service.delete_instance(&id)?;
                Ok(json_response(StatusCode::OK, &json!({ "deleted": id })))
            }

            (&Method::GET, Route::Changes(def, id)) => {
                let id = instance_id(def, id);
                let (handle, receiver) = service.subscribe(&id)?;
                tracing::debug!("{} streaming changes of {}", handle, id);

                let header = HeaderValue::from_str(&handle).ok();
                let body = SseBody {
                    receiver,
                    _guard: SubscriptionGuard {
                        service: service.clone(),
                        instance_id: id,
                        handle,
                    },
                };
                let mut response = with_status(StatusCode::OK, "text/event-stream", body.boxed());
                response
                    .headers_mut()
                    .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                if let Some(header) = header {
                    response.headers_mut().insert(SUBSCRIPTION_HEADER, header);
                }
                Ok(response)
            }
            (&Method::DELETE, Route::PendingSend(def, id, sendid)) => {
                let outcome = service.cancel_send(&instance_id(def, id), sendid)?;
                Ok(json_response(
                    StatusCode::OK,
                    &json!({ "sendid": sendid, "outcome": outcome.as_str() }),
                ))
            }

            (_, Route::Unknown) | (_, Route::Metrics) => Ok(error_response(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("no route for {}", req.uri().path()),
            )),
            _ => Ok(error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "METHOD_NOT_ALLOWED",
                format!("{} not allowed on {}", method, req.uri().path()),
            )),
        }
    }
}

fn operation_name(method: &Method, route: &Route<'_>) -> &'static str {
    match (method, route) {
        (_, Route::Health) => "health",
        (_, Route::Metrics) => "metrics",
        (&Method::GET, Route::Definitions) => "list_definitions",
        (&Method::PUT, Route::Definition(_)) => "create_definition",
        (&Method::GET, Route::Definition(_)) => "get_definition",
        (&Method::DELETE, Route::Definition(_)) => "delete_definition",
        (&Method::POST, Route::Definition(_)) => "create_instance",
        (&Method::GET, Route::AllInstances(_)) => "list_instances",
        (&Method::GET, Route::Instance(..)) => "get_snapshot",
        (&Method::POST, Route::Instance(..)) => "send_event",
        (&Method::DELETE, Route::Instance(..)) => "delete_instance",
        (&Method::GET, Route::Changes(..)) => "subscribe",
        (&Method::DELETE, Route::PendingSend(..)) => "cancel_send",
        _ => "unknown",
    }
}
