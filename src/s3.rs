//! S3-backed implementations of the backend seams.
//!
//! Bucket layout:
//!
//! ```text
//! media/{media_id}-{access_hash:016x}[-{thumb}]   file contents
//! messages/{channel}/{message}                    metadata-only marker
//! links/{token}                                   decimal message id
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::info;

use crate::backend::{
    BackendSession, ChannelId, LinkRegistry, MediaMessage, MessageId, MessageStore,
    SessionAuthenticator, SessionId,
};
use crate::error::ProxyError;
use crate::location::{DcId, FileLocation};

/// Where one datacenter's media lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcEndpoint {
    pub region: String,
    pub bucket: String,
}

/// Client overrides shared by every session.
#[derive(Debug, Clone, Default)]
pub struct S3Options {
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

pub fn build_client(sdk: &SdkConfig, region: Option<&str>, opts: &S3Options) -> Client {
    let mut builder = aws_sdk_s3::config::Builder::from(sdk);
    if let Some(r) = region {
        builder = builder.region(Region::new(r.to_owned()));
    }
    if let Some(url) = &opts.endpoint_url {
        builder = builder.endpoint_url(url);
    }
    if opts.force_path_style {
        builder = builder.force_path_style(true);
    }
    Client::from_conf(builder.build())
}

pub fn media_key(location: &FileLocation) -> String {
    let mut key = format!(
        "media/{}-{:016x}",
        location.media_id, location.access_hash as u64
    );
    if let Some(size) = &location.thumbnail_size {
        key.push('-');
        key.push_str(size);
    }
    key
}

/// One S3 identity bound to one datacenter's bucket.
#[derive(Clone)]
pub struct S3Session {
    client: Client,
    bucket: String,
    datacenter: DcId,
}

impl S3Session {
    pub fn new(client: Client, bucket: String, datacenter: DcId) -> Self {
        Self {
            client,
            bucket,
            datacenter,
        }
    }
}

#[async_trait]
impl BackendSession for S3Session {
    fn datacenter(&self) -> DcId {
        self.datacenter
    }

    async fn fetch_chunk(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, ProxyError> {
        let range = format!("bytes={offset}-{}", offset + limit.max(1) - 1);
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(media_key(location))
            .range(range)
            .send()
            .await
        {
            Ok(output) => output,
            // Offset at or past the end of the object.
            Err(err) if is_unsatisfiable(&err) => return Ok(Bytes::new()),
            Err(err) => return Err(map_get_err(err)),
        };

        output
            .body
            .collect()
            .await
            .map(|agg| agg.into_bytes())
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    }
}

/// Opens sessions in other datacenters using the identity of the asking
/// pool session.
pub struct S3Authenticator {
    identities: HashMap<SessionId, SdkConfig>,
    datacenters: HashMap<DcId, DcEndpoint>,
    opts: S3Options,
}

impl S3Authenticator {
    pub fn new(datacenters: HashMap<DcId, DcEndpoint>, opts: S3Options) -> Self {
        Self {
            identities: HashMap::new(),
            datacenters,
            opts,
        }
    }

    pub fn add_identity(&mut self, session: SessionId, sdk: SdkConfig) {
        self.identities.insert(session, sdk);
    }
}

#[async_trait]
impl SessionAuthenticator for S3Authenticator {
    async fn acquire_session(
        &self,
        session: SessionId,
        datacenter: DcId,
    ) -> Result<Arc<dyn BackendSession>, ProxyError> {
        let sdk = self
            .identities
            .get(&session)
            .ok_or_else(|| ProxyError::Internal(format!("no identity for session {session}")))?;
        let endpoint = self.datacenters.get(&datacenter).ok_or_else(|| {
            ProxyError::Upstream(format!("datacenter {datacenter} is not configured"))
        })?;

        let client = build_client(sdk, Some(&endpoint.region), &self.opts);
        client
            .head_bucket()
            .bucket(&endpoint.bucket)
            .send()
            .await
            .map_err(|e| {
                ProxyError::Upstream(format!(
                    "session {session} cannot reach datacenter {datacenter}: {e}"
                ))
            })?;
        info!(
            session,
            datacenter,
            region = %endpoint.region,
            bucket = %endpoint.bucket,
            "datacenter session ready"
        );

        Ok(Arc::new(S3Session::new(
            client,
            endpoint.bucket.clone(),
            datacenter,
        )))
    }
}

/// Message metadata kept as user metadata on marker objects.
pub struct S3MessageStore {
    client: Client,
    bucket: String,
}

impl S3MessageStore {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl MessageStore for S3MessageStore {
    async fn media(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<MediaMessage>, ProxyError> {
        let key = format!("messages/{channel}/{message}");
        let output = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(map_head_err)
        {
            Ok(output) => output,
            Err(ProxyError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(meta) = output.metadata() else {
            return Ok(None);
        };
        let Some(file_id) = meta.get("file-id") else {
            return Ok(None);
        };
        let file_size = meta
            .get("file-size")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| ProxyError::Internal(format!("{key}: missing or bad file-size")))?;

        Ok(Some(MediaMessage {
            file_id: file_id.clone(),
            file_name: meta.get("file-name").cloned(),
            file_size,
            mime_type: meta.get("mime-type").cloned(),
        }))
    }
}

pub struct S3LinkRegistry {
    client: Client,
    bucket: String,
}

impl S3LinkRegistry {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl LinkRegistry for S3LinkRegistry {
    async fn get(&self, token: &str) -> Result<Option<MessageId>, ProxyError> {
        let key = format!("links/{token}");
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(map_get_err)
        {
            Ok(output) => output,
            Err(ProxyError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?
            .into_bytes();
        std::str::from_utf8(&body)
            .ok()
            .and_then(|s| s.trim().parse::<MessageId>().ok())
            .map(Some)
            .ok_or_else(|| ProxyError::Internal(format!("{key}: body is not a message id")))
    }

    async fn put(&self, token: &str, message: MessageId) -> Result<(), ProxyError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(format!("links/{token}"))
            .content_type("text/plain")
            .body(ByteStream::from(message.to_string().into_bytes()))
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        Ok(())
    }
}

fn is_unsatisfiable(err: &SdkError<GetObjectError>) -> bool {
    err.raw_response()
        .is_some_and(|resp| resp.status().as_u16() == 416)
}

fn map_head_err(err: SdkError<HeadObjectError>) -> ProxyError {
    match &err {
        SdkError::ServiceError(se) if se.err().is_not_found() => {
            ProxyError::NotFound("object not found".into())
        }
        _ => ProxyError::Upstream(err.to_string()),
    }
}

fn map_get_err(err: SdkError<GetObjectError>) -> ProxyError {
    match &err {
        SdkError::ServiceError(se) if se.err().is_no_such_key() => {
            ProxyError::NotFound("object not found".into())
        }
        _ => ProxyError::Upstream(err.to_string()),
    }
}
