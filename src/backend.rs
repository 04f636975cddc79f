//! Seams to the remote media store and its surrounding services.
//!
//! The proxy never speaks the storage protocol directly: everything it needs
//! is a chunk fetch on a session, a way to open sessions in other
//! datacenters, a message lookup and a token lookup.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ProxyError;
use crate::location::{DcId, FileLocation};

pub type SessionId = u32;
pub type ChannelId = i64;
pub type MessageId = i64;

/// One authenticated connection to the media store.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Datacenter this session is bound to.
    fn datacenter(&self) -> DcId;

    /// Fetch up to `limit` bytes of the file starting at `offset`.
    /// An empty result means there is no data at that offset.
    async fn fetch_chunk(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, ProxyError>;
}

/// Opens a session for pool session `session` in a foreign datacenter.
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    async fn acquire_session(
        &self,
        session: SessionId,
        datacenter: DcId,
    ) -> Result<Arc<dyn BackendSession>, ProxyError>;
}

/// Media attached to a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMessage {
    pub file_id: String,
    pub file_name: Option<String>,
    pub file_size: u64,
    pub mime_type: Option<String>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// `Ok(None)` when the message does not exist or carries no media.
    async fn media(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<MediaMessage>, ProxyError>;
}

/// Short-token → message id registry, filled in at upload time.
#[async_trait]
pub trait LinkRegistry: Send + Sync {
    async fn get(&self, token: &str) -> Result<Option<MessageId>, ProxyError>;

    async fn put(&self, token: &str, message: MessageId) -> Result<(), ProxyError>;
}
