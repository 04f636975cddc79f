use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
    SERVER,
};
use axum::http::{HeaderMap, Response, StatusCode};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::backend::{LinkRegistry, MediaMessage, MessageId, MessageStore};
use crate::config::AppConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::location::FileLocation;
use crate::planner::{plan_request, RangePlan, RangeStatus};
use crate::pool::SessionPool;

const SERVER_NAME: &str = concat!("streamgate/", env!("CARGO_PKG_VERSION"));
const DEFAULT_MIME: &str = "application/octet-stream";
const RESOLUTIONS: [&str; 5] = ["2160p", "1080p", "720p", "480p", "360p"];

/// Shared application state injected into every request handler.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<AppConfig>,
    pub pool: Arc<SessionPool>,
    pub messages: Arc<dyn MessageStore>,
    pub links: Arc<dyn LinkRegistry>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn handle_health(State(state): State<ProxyState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.pool.len(),
    }))
}

// ---------------------------------------------------------------------------
// Share page data
// ---------------------------------------------------------------------------

/// Everything a share page needs; rendering is left to the front end.
#[derive(Debug, Serialize)]
pub struct ShowPage {
    pub file_name: String,
    pub file_size: String,
    pub mime_type: String,
    pub is_media: bool,
    pub direct_dl_link: String,
    pub mx_player_link: String,
    pub vlc_player_link: String,
}

pub async fn handle_show(
    State(state): State<ProxyState>,
    Path(token): Path<String>,
) -> ProxyResult<Json<ShowPage>> {
    if !is_valid_token(&token) {
        return Err(ProxyError::NotFound("link".into()));
    }
    let message_id = state
        .links
        .get(&token)
        .await?
        .ok_or_else(|| ProxyError::NotFound("link expired or invalid".into()))?;
    let media = lookup_media(&state, message_id).await?;

    let original = media.file_name.clone().unwrap_or_default();
    let mime_type = media.mime_type.clone().unwrap_or_else(|| DEFAULT_MIME.into());
    let dl_link = format!(
        "{}/dl/{message_id}/{}",
        state.config.base_url,
        sanitize_file_name(&original).replace(' ', "%20")
    );
    let intent_type = media.mime_type.as_deref().unwrap_or("video/*");

    Ok(Json(ShowPage {
        file_name: mask_file_name(&original),
        file_size: readable_size(media.file_size),
        is_media: mime_type.starts_with("video/") || mime_type.starts_with("audio/"),
        mime_type,
        mx_player_link: format!(
            "intent:{dl_link}#Intent;action=android.intent.action.VIEW;type={intent_type};end"
        ),
        vlc_player_link: format!("vlc://{dl_link}"),
        direct_dl_link: dl_link,
    }))
}

// ---------------------------------------------------------------------------
// HEAD /dl
// ---------------------------------------------------------------------------

pub async fn handle_head(
    State(state): State<ProxyState>,
    Path((message_id, file_name)): Path<(MessageId, String)>,
    headers: HeaderMap,
) -> ProxyResult<Response<Body>> {
    let media = lookup_media(&state, message_id).await?;
    let range_header = range_header(&headers);
    if media.file_size == 0 && range_header.is_none() {
        return build_response(&media, &file_name, None, Body::empty());
    }
    let planned = plan_request(range_header, media.file_size, state.config.chunk_size)?;
    build_response(&media, &file_name, Some(&planned), Body::empty())
}

// ---------------------------------------------------------------------------
// GET /dl
// ---------------------------------------------------------------------------

pub async fn handle_stream(
    State(state): State<ProxyState>,
    Path((message_id, file_name)): Path<(MessageId, String)>,
    headers: HeaderMap,
) -> ProxyResult<Response<Body>> {
    stream_media(&state, message_id, &file_name, &headers)
        .await
        .inspect_err(|e| {
            if e.is_unexpected() {
                error!(message_id, file_name = %file_name, "stream request failed: {e}");
            }
        })
}

async fn stream_media(
    state: &ProxyState,
    message_id: MessageId,
    file_name: &str,
    headers: &HeaderMap,
) -> ProxyResult<Response<Body>> {
    let session = state.pool.select_least_loaded()?;
    let streamer = state.pool.streamer(&session);

    let media = lookup_media(state, message_id).await?;
    let location = FileLocation::decode(&media.file_id)?;

    let range_header = range_header(headers);
    if media.file_size == 0 && range_header.is_none() {
        return build_response(&media, file_name, None, Body::empty());
    }
    let planned = plan_request(range_header, media.file_size, state.config.chunk_size)?;

    let backend = state.pool.acquire(&session, location.datacenter).await?;
    debug!(
        message_id,
        session = session.id(),
        datacenter = location.datacenter,
        from = planned.range.start,
        until = planned.range.end_inclusive,
        parts = planned.plan.part_count,
        "streaming"
    );
    let stream = streamer.stream(location, backend, planned.plan)?;
    build_response(&media, file_name, Some(&planned), Body::from_stream(stream))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn lookup_media(state: &ProxyState, message_id: MessageId) -> ProxyResult<MediaMessage> {
    state
        .messages
        .media(state.config.storage_channel, message_id)
        .await?
        .ok_or_else(|| ProxyError::NotFound(format!("message {message_id} has no media")))
}

/// A Range header that is present but not valid UTF-8 still counts as a
/// (malformed) range request.
fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(RANGE).map(|v| v.to_str().unwrap_or_default())
}

fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn sanitize_file_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'))
        .collect();
    let kept = kept.trim_end();
    if kept.is_empty() {
        "file".into()
    } else {
        kept.into()
    }
}

/// Hide most of a file name while keeping its resolution tag and extension.
fn mask_file_name(name: &str) -> String {
    if name.is_empty() {
        return "Protected File".into();
    }
    let mut name = name.to_string();
    let mut resolution = String::new();
    if let Some(res) = RESOLUTIONS.iter().find(|r| name.contains(*r)) {
        resolution = format!(" {res}");
        name = name.replace(res, "");
    }
    let (base, ext) = split_extension(&name);
    let masked: String = base
        .chars()
        .enumerate()
        .map(|(i, c)| if i % 3 == 0 && c.is_alphanumeric() { c } else { '*' })
        .collect();
    format!("{masked}{resolution}{ext}")
}

/// Split off the last extension, ignoring leading dots.
fn split_extension(name: &str) -> (&str, &str) {
    let leading_dots = name.len() - name.trim_start_matches('.').len();
    match name.rfind('.') {
        Some(i) if i > leading_dots => (&name[..i], &name[i..]),
        _ => (name, ""),
    }
}

fn readable_size(bytes: u64) -> String {
    const LABELS: [&str; 5] = ["", "K", "M", "G", "T"];
    if bytes == 0 {
        return "0B".into();
    }
    let mut size = bytes as f64;
    let mut n = 0;
    while size >= 1024.0 && n < LABELS.len() - 1 {
        size /= 1024.0;
        n += 1;
    }
    format!("{size:.2} {}B", LABELS[n])
}

// ---------------------------------------------------------------------------
// Response builder
// ---------------------------------------------------------------------------

fn build_response(
    media: &MediaMessage,
    url_file_name: &str,
    planned: Option<&RangePlan>,
    body: Body,
) -> ProxyResult<Response<Body>> {
    let partial = planned.filter(|p| p.status == RangeStatus::Partial);
    let status = if partial.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let content_length = planned.map_or(0, |p| p.content_length());
    let display_name = sanitize_file_name(media.file_name.as_deref().unwrap_or(url_file_name));

    let mut b = Response::builder()
        .status(status)
        .header(SERVER, SERVER_NAME)
        .header(
            CONTENT_TYPE,
            media.mime_type.as_deref().unwrap_or(DEFAULT_MIME),
        )
        .header(ACCEPT_RANGES, "bytes")
        .header(CONTENT_LENGTH, content_length)
        .header(
            CONTENT_DISPOSITION,
            format!("inline; filename=\"{display_name}\""),
        );
    if let Some(p) = partial {
        b = b.header(
            CONTENT_RANGE,
            format!(
                "bytes {}-{}/{}",
                p.range.start, p.range.end_inclusive, media.file_size
            ),
        );
    }
    b.body(body)
        .map_err(|e| ProxyError::Internal(format!("building response: {e}")))
}
