use axum::{
    http::Method,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::{error::AppError, AppState};

pub mod chat;
pub mod compare;
pub mod generation;
pub mod sessions;

pub fn routes(max_file_size: usize) -> Router<Arc<AppState>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_check))
        .merge(sessions::routes(max_file_size))
        .merge(generation::routes())
        .merge(chat::routes())
        .merge(compare::routes())
        .layer(cors)
}

async fn health_check() -> &'static str {
    "OK"
}

pub type EventStream = Sse<BoxStream<'static, Result<Event, Infallible>>>;

/// A named event with its JSON-encoded payload, before it becomes SSE text.
#[derive(Debug, Clone, PartialEq)]
struct Outgoing {
    kind: String,
    data: String,
}

/// Producer side of one SSE response.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl EventSink {
    /// Sends a named JSON event. Fails with [`AppError::Cancelled`] once the
    /// client has gone away.
    pub fn send<T: Serialize + ?Sized>(&self, kind: &str, payload: &T) -> Result<(), AppError> {
        let data = serde_json::to_string(payload)
            .map_err(|e| AppError::Internal(format!("Failed to encode {} event: {}", kind, e)))?;
        self.tx
            .send(Outgoing {
                kind: kind.to_string(),
                data,
            })
            .map_err(|_| AppError::Cancelled)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel::<Outgoing>();
    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|out| (Ok(Event::default().event(out.kind).data(out.data)), rx))
    })
    .boxed();
    (EventSink { tx }, Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Runs `operation` in the background and streams its events. The result
/// is sent as `complete`, a failure as `failed`; a client disconnect drops
/// the operation, releasing whatever it holds.
pub fn stream_operation<F, Fut, T>(name: &'static str, operation: F) -> EventStream
where
    F: FnOnce(EventSink) -> Fut,
    Fut: Future<Output = Result<T, AppError>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let (sink, events) = event_channel();
    let running = operation(sink.clone());
    spawn_operation(name, running, sink);
    events
}

fn spawn_operation<Fut, T>(name: &'static str, running: Fut, sink: EventSink) -> JoinHandle<()>
where
    Fut: Future<Output = Result<T, AppError>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    tokio::spawn(async move {
        let start = std::time::Instant::now();
        let result = tokio::select! {
            result = running => result,
            _ = sink.closed() => Err(AppError::Cancelled),
        };
        match result {
            Ok(payload) => {
                tracing::info!("{} completed in {:?}", name, start.elapsed());
                let _ = sink.send("complete", &payload);
            }
            Err(AppError::Cancelled) => {
                tracing::info!("{} cancelled after {:?}", name, start.elapsed());
            }
            Err(e) => {
                let e = match e {
                    failed @ AppError::OperationFailed { .. } => failed,
                    other => AppError::during(name)(other),
                };
                tracing::error!("{}", e);
                let _ = sink.send("failed", &json!({ "error": e.to_string() }));
            }
        }
    })
}
