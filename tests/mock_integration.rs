use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;

use streamgate::backend::{
    BackendSession, ChannelId, LinkRegistry, MediaMessage, MessageId, MessageStore,
    SessionAuthenticator, SessionId,
};
use streamgate::config::AppConfig;
use streamgate::error::ProxyError;
use streamgate::handler::ProxyState;
use streamgate::location::{DcId, FileLocation, FileType};
use streamgate::pool::SessionPool;
use streamgate::s3::S3Options;
use streamgate::server::build_router;

const MIB: u64 = 1024 * 1024;
const CHANNEL: ChannelId = -100_200_300;
const HOME_DC: DcId = 1;
const FOREIGN_DC: DcId = 4;

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// Serves media bytes keyed by media id, one chunk at a time.
struct MockSession {
    datacenter: DcId,
    files: Arc<HashMap<i64, Bytes>>,
    fetches: AtomicUsize,
    delay: Option<Duration>,
}

impl MockSession {
    fn new(datacenter: DcId, files: Arc<HashMap<i64, Bytes>>) -> Self {
        Self {
            datacenter,
            files,
            fetches: AtomicUsize::new(0),
            delay: None,
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendSession for MockSession {
    fn datacenter(&self) -> DcId {
        self.datacenter
    }

    async fn fetch_chunk(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, ProxyError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let Some(data) = self.files.get(&location.media_id) else {
            return Ok(Bytes::new());
        };
        let len = data.len() as u64;
        let start = offset.min(len) as usize;
        let end = (offset + limit).min(len) as usize;
        Ok(data.slice(start..end))
    }
}

struct MockAuth {
    files: Arc<HashMap<i64, Bytes>>,
    handshakes: AtomicUsize,
}

#[async_trait]
impl SessionAuthenticator for MockAuth {
    async fn acquire_session(
        &self,
        _session: SessionId,
        datacenter: DcId,
    ) -> Result<Arc<dyn BackendSession>, ProxyError> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession::new(datacenter, self.files.clone())))
    }
}

struct MockMessages {
    media: HashMap<MessageId, MediaMessage>,
}

#[async_trait]
impl MessageStore for MockMessages {
    async fn media(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<MediaMessage>, ProxyError> {
        assert_eq!(channel, CHANNEL);
        Ok(self.media.get(&message).cloned())
    }
}

#[derive(Default)]
struct MockLinks {
    links: Mutex<HashMap<String, MessageId>>,
}

#[async_trait]
impl LinkRegistry for MockLinks {
    async fn get(&self, token: &str) -> Result<Option<MessageId>, ProxyError> {
        Ok(self.links.lock().get(token).copied())
    }

    async fn put(&self, token: &str, message: MessageId) -> Result<(), ProxyError> {
        self.links.lock().insert(token.to_string(), message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn test_config() -> AppConfig {
    AppConfig {
        bind_ip: std::net::IpAddr::from([127, 0, 0, 1]),
        port: 0,
        base_url: "http://media.test".into(),
        storage_channel: CHANNEL,
        chunk_size: MIB,
        bucket: "test-bucket".into(),
        region: None,
        home_dc: HOME_DC,
        datacenters: HashMap::new(),
        session_profiles: Vec::new(),
        s3: S3Options::default(),
    }
}

fn make_payload(size: u64) -> Bytes {
    (0..size).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

fn file_id(media_id: i64, datacenter: DcId) -> String {
    FileLocation {
        file_type: FileType::Video,
        datacenter,
        media_id,
        access_hash: 0x5eed,
        file_reference: vec![3, 1, 4, 1, 5],
        thumbnail_size: None,
    }
    .encode()
}

fn media(media_id: i64, datacenter: DcId, size: u64, name: &str) -> MediaMessage {
    MediaMessage {
        file_id: file_id(media_id, datacenter),
        file_name: Some(name.into()),
        file_size: size,
        mime_type: Some("video/mp4".into()),
    }
}

/// Message 1: 3 MiB at home. Message 2: 2.5 MiB in a foreign datacenter.
/// Message 3: promises 3 MiB but the backend only has 1.5 MiB.
/// Message 4: empty file. Message 5: a message without media is absent.
struct Fixture {
    pool: Arc<SessionPool>,
    auth: Arc<MockAuth>,
    sessions: Vec<Arc<MockSession>>,
    links: Arc<MockLinks>,
    payload: Bytes,
    foreign_payload: Bytes,
}

impl Fixture {
    fn new(session_count: u32) -> Self {
        Self::with_delay(session_count, None)
    }

    fn with_delay(session_count: u32, delay: Option<Duration>) -> Self {
        let payload = make_payload(3 * MIB);
        let foreign_payload = make_payload(2 * MIB + MIB / 2);
        let files: Arc<HashMap<i64, Bytes>> = Arc::new(
            [
                (11, payload.clone()),
                (12, foreign_payload.clone()),
                (13, payload.slice(..(3 * MIB / 2) as usize)),
            ]
            .into_iter()
            .collect(),
        );
        let auth = Arc::new(MockAuth {
            files: files.clone(),
            handshakes: AtomicUsize::new(0),
        });
        let pool = Arc::new(SessionPool::new(auth.clone()));
        let mut sessions = Vec::new();
        for id in 0..session_count {
            let mut session = MockSession::new(HOME_DC, files.clone());
            session.delay = delay;
            let session = Arc::new(session);
            pool.register(id, session.clone());
            sessions.push(session);
        }
        Self {
            pool,
            auth,
            sessions,
            links: Arc::new(MockLinks::default()),
            payload,
            foreign_payload,
        }
    }

    fn state(&self) -> ProxyState {
        let messages = MockMessages {
            media: [
                (1, media(11, HOME_DC, 3 * MIB, "movie.mp4")),
                (2, media(12, FOREIGN_DC, 2 * MIB + MIB / 2, "far away.mp4")),
                (3, media(13, HOME_DC, 3 * MIB, "cut short.mp4")),
                (4, media(14, HOME_DC, 0, "empty.bin")),
            ]
            .into_iter()
            .collect(),
        };
        ProxyState {
            config: Arc::new(test_config()),
            pool: self.pool.clone(),
            messages: Arc::new(messages),
            links: self.links.clone(),
        }
    }

    fn total_fetches(&self) -> usize {
        self.sessions.iter().map(|s| s.fetches()).sum()
    }

    async fn wait_for_idle(&self) {
        for _ in 0..500 {
            let busy = (0..self.sessions.len() as u32)
                .any(|id| self.pool.load(id) != Some(0));
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("load counters did not return to zero");
    }
}

async fn start_server(state: ProxyState) -> String {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn header<'a>(resp: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    resp.headers().get(name).map(|v| v.to_str().unwrap())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_get_returns_whole_file() {
    let fx = Fixture::new(1);
    let base = start_server(fx.state()).await;

    let resp = reqwest::get(format!("{base}/dl/1/movie.mp4")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(header(&resp, "content-length"), Some("3145728"));
    assert_eq!(header(&resp, "accept-ranges"), Some("bytes"));
    assert_eq!(header(&resp, "content-type"), Some("video/mp4"));
    assert_eq!(
        header(&resp, "content-disposition"),
        Some("inline; filename=\"movie.mp4\"")
    );
    assert_eq!(header(&resp, "content-range"), None);
    let body = resp.bytes().await.unwrap();
    assert_eq!(body, fx.payload);

    assert_eq!(fx.sessions[0].fetches(), 3);
    fx.wait_for_idle().await;
}

#[tokio::test]
async fn partial_range_across_chunk_boundary() {
    let fx = Fixture::new(1);
    let base = start_server(fx.state()).await;

    let resp = reqwest::Client::new()
        .get(format!("{base}/dl/1/movie.mp4"))
        .header("Range", "bytes=500000-1500000")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(
        header(&resp, "content-range"),
        Some("bytes 500000-1500000/3145728")
    );
    assert_eq!(header(&resp, "content-length"), Some("1000001"));
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), 1_000_001);
    assert_eq!(body, fx.payload.slice(500_000..=1_500_000));

    assert_eq!(fx.sessions[0].fetches(), 2);
    fx.wait_for_idle().await;
}

#[tokio::test]
async fn open_ended_and_tail_ranges() {
    let fx = Fixture::new(1);
    let base = start_server(fx.state()).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/dl/1/movie.mp4"))
        .header("Range", "bytes=3000000-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(
        header(&resp, "content-range"),
        Some("bytes 3000000-3145727/3145728")
    );
    assert_eq!(resp.bytes().await.unwrap(), fx.payload.slice(3_000_000..));

    let resp = client
        .get(format!("{base}/dl/1/movie.mp4"))
        .header("Range", "bytes=3145727-3145727")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.bytes().await.unwrap(), fx.payload.slice(3_145_727..));
    fx.wait_for_idle().await;
}

#[tokio::test]
async fn unsatisfiable_ranges_fetch_nothing() {
    let fx = Fixture::new(1);
    let base = start_server(fx.state()).await;
    let client = reqwest::Client::new();

    for range in ["bytes=0-3145728", "bytes=-5-10", "bytes=10-5", "bytes=-100", "pages=1-2"] {
        let resp = client
            .get(format!("{base}/dl/1/movie.mp4"))
            .header("Range", range)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 416, "{range}");
        assert_eq!(header(&resp, "content-range"), Some("bytes */3145728"));
    }
    assert_eq!(fx.total_fetches(), 0);
    assert_eq!(fx.pool.load(0), Some(0));
}

#[tokio::test]
async fn missing_media_returns_404() {
    let fx = Fixture::new(1);
    let base = start_server(fx.state()).await;

    let resp = reqwest::get(format!("{base}/dl/5/whatever.mkv")).await.unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(fx.pool.load(0), Some(0));
}

#[tokio::test]
async fn empty_pool_returns_503() {
    let fx = Fixture::new(0);
    let base = start_server(fx.state()).await;

    let resp = reqwest::get(format!("{base}/dl/1/movie.mp4")).await.unwrap();
    assert_eq!(resp.status(), 503);
    assert!(fx.pool.is_empty());
    assert_eq!(fx.auth.handshakes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_file_streams_nothing() {
    let fx = Fixture::new(1);
    let base = start_server(fx.state()).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/dl/4/empty.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(header(&resp, "content-length"), Some("0"));
    assert!(resp.bytes().await.unwrap().is_empty());

    let resp = client
        .get(format!("{base}/dl/4/empty.bin"))
        .header("Range", "bytes=0-0")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);
    assert_eq!(fx.total_fetches(), 0);
}

#[tokio::test]
async fn foreign_datacenter_session_is_reused() {
    let fx = Fixture::new(1);
    let base = start_server(fx.state()).await;

    for _ in 0..2 {
        let resp = reqwest::get(format!("{base}/dl/2/far.mp4")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            header(&resp, "content-disposition"),
            Some("inline; filename=\"far away.mp4\"")
        );
        assert_eq!(resp.bytes().await.unwrap(), fx.foreign_payload);
    }
    assert_eq!(fx.auth.handshakes.load(Ordering::SeqCst), 1);
    // The home session never served the foreign file.
    assert_eq!(fx.sessions[0].fetches(), 0);
    fx.wait_for_idle().await;
}

#[tokio::test]
async fn busy_session_is_skipped() {
    let fx = Fixture::new(2);
    let base = start_server(fx.state()).await;

    fx.pool.adjust_load(0, 1).unwrap();
    let resp = reqwest::get(format!("{base}/dl/1/movie.mp4")).await.unwrap();
    assert_eq!(resp.bytes().await.unwrap(), fx.payload);
    assert_eq!(fx.sessions[0].fetches(), 0);
    assert_eq!(fx.sessions[1].fetches(), 3);

    fx.pool.adjust_load(0, -1).unwrap();
    fx.wait_for_idle().await;
}

#[tokio::test]
async fn client_disconnect_releases_load() {
    let fx = Fixture::with_delay(1, Some(Duration::from_millis(50)));
    let base = start_server(fx.state()).await;

    let mut resp = reqwest::get(format!("{base}/dl/1/movie.mp4")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let first = resp.chunk().await.unwrap().unwrap();
    assert!(!first.is_empty());
    assert_eq!(fx.pool.load(0), Some(1));
    drop(resp);

    fx.wait_for_idle().await;
}

#[tokio::test]
async fn short_backend_read_ends_response() {
    let fx = Fixture::new(1);
    let base = start_server(fx.state()).await;

    let resp = reqwest::get(format!("{base}/dl/3/cut.mp4")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(header(&resp, "content-length"), Some("3145728"));
    // The body stops short of Content-Length, so the client sees either a
    // truncated body or a transport error.
    if let Ok(body) = resp.bytes().await {
        assert!(body.len() < 3 * MIB as usize);
    }
    assert_eq!(fx.sessions[0].fetches(), 2);
    fx.wait_for_idle().await;
}

#[tokio::test]
async fn concurrent_streams_balance_to_zero() {
    let fx = Fixture::new(3);
    let base = start_server(fx.state()).await;

    let mut handles = Vec::new();
    for i in 0..8u64 {
        let url = format!("{base}/dl/1/movie.mp4");
        handles.push(tokio::spawn(async move {
            let start = i * 100_000;
            let resp = reqwest::Client::new()
                .get(&url)
                .header("Range", format!("bytes={start}-"))
                .send()
                .await
                .unwrap();
            (start, resp.status().as_u16(), resp.bytes().await.unwrap())
        }));
    }

    for handle in handles {
        let (start, status, body) = handle.await.unwrap();
        assert_eq!(status, 206);
        assert_eq!(body, fx.payload.slice(start as usize..));
    }
    fx.wait_for_idle().await;
}

#[tokio::test]
async fn head_request_reports_headers_only() {
    let fx = Fixture::new(1);
    let base = start_server(fx.state()).await;
    let client = reqwest::Client::new();

    let resp = client
        .head(format!("{base}/dl/1/movie.mp4"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(header(&resp, "content-length"), Some("3145728"));
    assert_eq!(header(&resp, "accept-ranges"), Some("bytes"));
    assert!(header(&resp, "server").unwrap().starts_with("streamgate/"));
    assert!(resp.bytes().await.unwrap().is_empty());

    let resp = client
        .head(format!("{base}/dl/1/movie.mp4"))
        .header("Range", "bytes=100-199")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(header(&resp, "content-range"), Some("bytes 100-199/3145728"));

    assert_eq!(fx.total_fetches(), 0);
    assert_eq!(fx.pool.load(0), Some(0));
}

#[tokio::test]
async fn show_page_resolves_token() {
    let fx = Fixture::new(1);
    fx.links.put("Ab3_x-9Q", 2).await.unwrap();
    let base = start_server(fx.state()).await;

    let resp = reqwest::get(format!("{base}/show/Ab3_x-9Q")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let page: Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
    assert_eq!(page["file_name"], "f*****a*.mp4");
    assert_eq!(page["file_size"], "2.50 MB");
    assert_eq!(page["is_media"], true);
    assert_eq!(page["direct_dl_link"], "http://media.test/dl/2/far%20away.mp4");
    assert_eq!(page["vlc_player_link"], "vlc://http://media.test/dl/2/far%20away.mp4");
    assert_eq!(
        page["mx_player_link"],
        "intent:http://media.test/dl/2/far%20away.mp4#Intent;action=android.intent.action.VIEW;type=video/mp4;end"
    );

    let resp = reqwest::get(format!("{base}/show/unknown")).await.unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(fx.total_fetches(), 0);
}

#[tokio::test]
async fn health_check() {
    let fx = Fixture::new(2);
    let base = start_server(fx.state()).await;

    let resp = reqwest::get(format!("{base}/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 2);
}
