use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use tracing::{debug, warn};

use crate::backend::{BackendSession, SessionId};
use crate::error::ProxyError;
use crate::location::FileLocation;
use crate::planner::BytePlan;
use crate::pool::{LoadClaim, PooledSession};

pub type BoxByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

/// Produces byte streams on behalf of one pool session.
///
/// The streamer only keeps a weak reference to its session; the pool owns
/// the session. Every call to [`ChunkStreamer::stream`] builds independent
/// state, so one streamer serves any number of concurrent requests.
pub struct ChunkStreamer {
    session: Weak<PooledSession>,
}

impl ChunkStreamer {
    pub(crate) fn new(session: &Arc<PooledSession>) -> Self {
        Self {
            session: Arc::downgrade(session),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.upgrade().map(|s| s.id())
    }

    /// Stream exactly the bytes `plan` describes, fetching one chunk at a time
    /// from `backend`.
    ///
    /// The session's load counter is raised here and lowered when the
    /// returned stream ends, fails, is closed or is dropped.
    pub fn stream(
        &self,
        location: FileLocation,
        backend: Arc<dyn BackendSession>,
        plan: BytePlan,
    ) -> Result<ChunkStream, ProxyError> {
        let session = self.session.upgrade().ok_or(ProxyError::PoolUnavailable)?;
        let claim = session.claim();
        let session_id = session.id();

        let inner = try_stream! {
            let mut offset = plan.offset;
            let mut sent = 0u64;

            for part in 1..=plan.part_count {
                let chunk = backend
                    .fetch_chunk(&location, offset, plan.chunk_size)
                    .await?;
                let available = chunk.len() as u64;
                let (want_start, want_end) = plan.part_bounds(part);
                debug!(session = session_id, part, offset, bytes = available, "chunk fetched");

                let end = want_end.min(available);
                let start = want_start.min(end);
                if end > start {
                    let piece = chunk.slice(start as usize..end as usize);
                    sent += piece.len() as u64;
                    yield piece;
                }

                if available < want_end {
                    warn!(
                        session = session_id,
                        media_id = location.media_id,
                        part,
                        parts = plan.part_count,
                        offset,
                        sent,
                        expected = plan.byte_len(),
                        "short chunk from backend, ending stream early"
                    );
                    break;
                }
                offset += plan.chunk_size;
            }

            debug!(session = session_id, media_id = location.media_id, sent, "stream finished");
        };

        Ok(ChunkStream {
            inner: Some(Box::pin(inner)),
            claim: Some(claim),
        })
    }
}

/// Ordered chunk sequence for one request. Not restartable.
///
/// Holds the session's load claim until the sequence finishes, yields an
/// error, is closed or is dropped, whichever happens first.
pub struct ChunkStream {
    inner: Option<BoxByteStream>,
    claim: Option<LoadClaim>,
}

impl ChunkStream {
    /// Stop fetching and release the load claim. Later polls yield `None`.
    pub fn close(&mut self) {
        self.inner = None;
        self.claim = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl Stream for ChunkStream {
    type Item = Result<Bytes, ProxyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(Err(e))) => {
                this.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.close();
                Poll::Ready(None)
            }
        }
    }
}
