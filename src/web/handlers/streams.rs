//! Streaming endpoints: named relays and direct channel proxies, each in
//! MPEG-TS and HLS-labelled variants.
//!
//! Every request passes the admission gate, resolves its target, claims a
//! connection slot and attaches to the shared session for that target. The
//! response body is the subscriber's queue; dropping the body (client gone,
//! request cancelled) detaches the subscriber and closes its connection
//! record.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::error;
use uuid::Uuid;

use crate::models::{OutputFormat, UserCredential};
use crate::repositories::{ConnectionGuard, ConnectionRepository, TargetRepository};
use crate::streaming::{channel_session_key, relay_session_key, ExpiredNotifier, StreamSession};
use crate::web::auth::{admit, Admission, StreamAuthQuery};
use crate::web::limiter::ConnectionPermit;
use crate::web::AppState;

use std::net::SocketAddr;

const NOTICE_FALLBACK_TEXT: &str =
    "SUBSCRIPTION EXPIRED\n\nYour subscription has expired.\nPlease contact your administrator.";

/// Request metadata captured for connection tracking and hub bookkeeping.
struct ClientMeta {
    remote_addr: String,
    user_agent: Option<String>,
}

fn client_meta(connect_info: Option<ConnectInfo<SocketAddr>>, headers: &HeaderMap) -> ClientMeta {
    ClientMeta {
        remote_addr: connect_info
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
    }
}

/// A resolved stream target ready to be attached to.
struct StreamTarget {
    key: String,
    source_urls: Vec<String>,
    format: OutputFormat,
    channel_id: Option<i64>,
}

pub async fn stream_relay(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(auth): Query<StreamAuthQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let client = client_meta(connect_info, &headers);
    relay_stream(state, path, auth, client, false).await
}

pub async fn stream_relay_hls(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(auth): Query<StreamAuthQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let client = client_meta(connect_info, &headers);
    relay_stream(state, path, auth, client, true).await
}

pub async fn proxy_channel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(auth): Query<StreamAuthQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let client = client_meta(connect_info, &headers);
    channel_stream(state, id, auth, client, false).await
}

pub async fn proxy_channel_hls(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(auth): Query<StreamAuthQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let client = client_meta(connect_info, &headers);
    channel_stream(state, id, auth, client, true).await
}

async fn relay_stream(
    state: AppState,
    path: String,
    auth: StreamAuthQuery,
    client: ClientMeta,
    hls: bool,
) -> Response {
    let user = match admit(&state.database, &auth).await {
        Ok(Admission::Granted(user)) => user,
        Ok(Admission::Notice(_)) => return serve_notice(&state).await,
        Err(e) => return e.into_response(),
    };

    let targets = TargetRepository::new(state.database.pool().clone());
    let relay = match targets.resolve_relay(&path).await {
        Ok(Some(relay)) => relay,
        Ok(None) => return (StatusCode::NOT_FOUND, "Relay not found").into_response(),
        Err(e) => {
            error!("relay lookup failed for {}: {}", path, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };
    if !relay.active {
        return (StatusCode::FORBIDDEN, "Relay is disabled").into_response();
    }

    let format = if hls { OutputFormat::Hls } else { OutputFormat::MpegTs };
    let target = StreamTarget {
        key: relay_session_key(&path, hls),
        source_urls: relay.source_urls,
        format,
        // Relays created per-channel carry a `channel-{id}` output path;
        // use it to attribute the connection to that channel.
        channel_id: path
            .strip_prefix("channel-")
            .and_then(|raw| raw.parse().ok()),
    };
    serve_stream(state, user, target, client).await
}

async fn channel_stream(
    state: AppState,
    channel_id: i64,
    auth: StreamAuthQuery,
    client: ClientMeta,
    hls: bool,
) -> Response {
    let user = match admit(&state.database, &auth).await {
        Ok(Admission::Granted(user)) => user,
        Ok(Admission::Notice(_)) => return serve_notice(&state).await,
        Err(e) => return e.into_response(),
    };

    let targets = TargetRepository::new(state.database.pool().clone());
    let channel = match targets.resolve_channel(channel_id).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return (StatusCode::NOT_FOUND, "Channel not found").into_response(),
        Err(e) => {
            error!("channel lookup failed for {}: {}", channel_id, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };
    if !channel.active {
        return (StatusCode::FORBIDDEN, "Channel is disabled").into_response();
    }

    let format = if hls { OutputFormat::Hls } else { OutputFormat::MpegTs };
    let target = StreamTarget {
        key: channel_session_key(channel_id, hls),
        source_urls: vec![channel.url],
        format,
        channel_id: Some(channel_id),
    };
    serve_stream(state, user, target, client).await
}

/// Common tail of every streaming request: limiter, session attach,
/// connection record, streaming response.
async fn serve_stream(
    state: AppState,
    user: UserCredential,
    target: StreamTarget,
    client: ClientMeta,
) -> Response {
    let permit = match state
        .limiter
        .acquire(user.id, user.max_connections)
        .await
    {
        Ok(permit) => permit,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };

    let session = state
        .registry
        .get_or_create(&target.key, target.source_urls, target.format)
        .await;

    let connections = ConnectionRepository::new(state.database.pool().clone());
    let connection = connections
        .open_guarded(user.id, target.channel_id, &client.remote_addr)
        .await;

    let (subscriber_id, receiver) = match session
        .attach(client.remote_addr, client.user_agent)
        .await
    {
        Ok(pair) => pair,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Channel temporarily unavailable: {e}"),
            )
                .into_response();
        }
    };

    let stream = SessionStream {
        receiver,
        session,
        subscriber_id,
        _connection: connection,
        _permit: permit,
    };
    streaming_response(target.format.content_type(), stream)
}

/// Serve the expired-notice stream, or a plain-text notice when the asset
/// is missing. Deliberately 200 for the stream: a lapsed account is not an
/// error for the player.
async fn serve_notice(state: &AppState) -> Response {
    if !state.expired.video_available() {
        return (StatusCode::FORBIDDEN, NOTICE_FALLBACK_TEXT).into_response();
    }

    let (subscriber_id, receiver) = state.expired.attach().await;
    let stream = NoticeStream {
        receiver,
        notifier: state.expired.clone(),
        subscriber_id,
    };
    streaming_response(OutputFormat::MpegTs.content_type(), stream)
}

fn streaming_response<S>(content_type: &'static str, stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::CONNECTION, "keep-alive")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");

    match builder.body(Body::from_stream(stream)) {
        Ok(response) => response,
        Err(e) => {
            error!("failed to build streaming response: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Streaming unsupported").into_response()
        }
    }
}

/// Body stream for a session subscriber. Ends when the queue closes
/// (session stopped or blacklisted); detaches on drop so client
/// disconnects always release the subscription, the connection record and
/// the limiter slot.
struct SessionStream {
    receiver: mpsc::Receiver<Bytes>,
    session: Arc<StreamSession>,
    subscriber_id: Uuid,
    _connection: Option<ConnectionGuard>,
    _permit: Option<ConnectionPermit>,
}

impl Stream for SessionStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        let session = self.session.clone();
        let subscriber_id = self.subscriber_id;
        tokio::spawn(async move {
            session.detach(subscriber_id).await;
        });
    }
}

/// Body stream for an expired-notice subscriber.
struct NoticeStream {
    receiver: mpsc::Receiver<Bytes>,
    notifier: Arc<ExpiredNotifier>,
    subscriber_id: Uuid,
}

impl Stream for NoticeStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

impl Drop for NoticeStream {
    fn drop(&mut self) {
        let notifier = self.notifier.clone();
        let subscriber_id = self.subscriber_id;
        tokio::spawn(async move {
            notifier.detach(subscriber_id).await;
        });
    }
}
