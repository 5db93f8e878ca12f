use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use zelana_signature::Signature;
use zephyr::{AuthEnvelope, Frame, FrameCodec, ProtocolError};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no register frame within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before register")]
    Closed,

    #[error("expected Register frame, got {0}")]
    UnexpectedFrame(&'static str),

    #[error("identity signature rejected: {0}")]
    BadSignature(ProtocolError),

    #[error("identity timestamp is {age_secs}s off, outside the {max_age_secs}s window")]
    Stale { age_secs: i64, max_age_secs: i64 },

    #[error("register envelope already used")]
    Replayed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Admits each signed envelope once, and only while its timestamp is within
/// `max_age` of the coordinator clock.
///
/// Entries are dropped once they would fail the freshness check anyway.
pub struct ReplayGuard {
    max_age_secs: i64,
    seen: DashMap<Signature, i64>,
}

impl ReplayGuard {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age_secs: i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX),
            seen: DashMap::new(),
        }
    }

    pub fn admit(&self, envelope: &AuthEnvelope) -> Result<(), HandshakeError> {
        self.admit_at(envelope, chrono::Utc::now().timestamp())
    }

    fn admit_at(&self, envelope: &AuthEnvelope, now: i64) -> Result<(), HandshakeError> {
        let age_secs = now.saturating_sub(envelope.identity.timestamp);
        if age_secs.saturating_abs() > self.max_age_secs {
            return Err(HandshakeError::Stale {
                age_secs,
                max_age_secs: self.max_age_secs,
            });
        }

        let cutoff = now.saturating_sub(self.max_age_secs);
        self.seen.retain(|_, ts| *ts >= cutoff);
        match self.seen.entry(envelope.signature) {
            Entry::Occupied(_) => Err(HandshakeError::Replayed),
            Entry::Vacant(slot) => {
                slot.insert(envelope.identity.timestamp);
                Ok(())
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Reads the first frame and checks it is a correctly signed, fresh,
/// never-seen `Register`.
///
/// The registry is untouched here; the caller registers the worker only on `Ok`.
pub async fn read_register<T>(
    framed: &mut Framed<T, FrameCodec>,
    timeout: Duration,
    guard: &ReplayGuard,
) -> Result<AuthEnvelope, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match tokio::time::timeout(timeout, framed.next()).await {
        Err(_) => return Err(HandshakeError::Timeout(timeout)),
        Ok(None) => return Err(HandshakeError::Closed),
        Ok(Some(frame)) => frame?,
    };

    let envelope = match frame {
        Frame::Register(envelope) => envelope,
        other => return Err(HandshakeError::UnexpectedFrame(other.kind())),
    };
    envelope.verify().map_err(HandshakeError::BadSignature)?;
    guard.admit(&envelope)?;
    Ok(envelope)
}
