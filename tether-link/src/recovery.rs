//! Table of sessions parked for recovery.

use crate::session::SessionHandle;
use dashmap::DashMap;
use std::time::Instant;
use tokio::task::JoinHandle;

struct Parked {
    handle: SessionHandle,
    parked_at: Instant,
    expiry: JoinHandle<()>,
}

/// Recovery tokens of recently disconnected sessions, each with an expiry timer.
///
/// Removal is the single point of arbitration between a resuming peer and the
/// expiry timer: whichever removes the entry first owns the session.
#[derive(Default)]
pub struct RecoveryManager {
    parked: DashMap<String, Parked>,
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `handle` under `token` until `expiry` fires or the token is claimed.
    pub fn park(&self, token: String, handle: SessionHandle, expiry: JoinHandle<()>) {
        if let Some(previous) = self.parked.insert(
            token,
            Parked {
                handle,
                parked_at: Instant::now(),
                expiry,
            },
        ) {
            previous.expiry.abort();
        }
    }

    /// Claims a parked session for a resuming peer, cancelling its timer.
    pub fn claim(&self, token: &str) -> Option<SessionHandle> {
        let (_, parked) = self.parked.remove(token)?;
        parked.expiry.abort();
        tracing::debug!(
            "Claimed session {} after {:?}",
            parked.handle,
            parked.parked_at.elapsed()
        );
        Some(parked.handle)
    }

    /// Removes an entry whose window has closed.
    pub fn expire(&self, token: &str) -> Option<SessionHandle> {
        let (_, parked) = self.parked.remove(token)?;
        parked.expiry.abort();
        Some(parked.handle)
    }

    pub fn is_parked(&self, token: &str) -> bool {
        self.parked.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    /// Returns every parked token.
    pub fn tokens(&self) -> Vec<String> {
        self.parked.iter().map(|e| e.key().clone()).collect()
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("parked", &self.parked.len())
            .finish()
    }
}
