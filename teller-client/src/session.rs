//! Session token and its write-through cache.
//!
//! The cache is keyed by account identity (the phone number). The first
//! resolution of an identity loads from the [`SessionStorage`]; from then on
//! the in-memory value is canonical and only changes through
//! [`SessionCache::store`] or [`SessionCache::invalidate`], both of which write
//! through to storage before updating memory.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::session_backend::SessionStorage;

// ─── Session ──────────────────────────────────────────────────────────────────

/// Opaque session token issued by the provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the id is a bearer credential
        f.write_str("Session { id: <redacted> }")
    }
}

// ─── SessionCache ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Slot {
    loaded: bool,
    value:  Option<Session>,
}

pub struct SessionCache {
    storage: Arc<dyn SessionStorage>,
    slots:   Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl SessionCache {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self { storage, slots: Mutex::new(HashMap::new()) }
    }

    async fn slot(&self, identity: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().await;
        slots.entry(identity.to_string()).or_default().clone()
    }

    /// The current session for `identity`, loading it from storage on first use.
    ///
    /// Concurrent callers for the same identity wait on the same slot, so
    /// storage sees at most one load.
    pub async fn resolve(&self, identity: &str) -> std::io::Result<Option<Session>> {
        let slot = self.slot(identity).await;
        let mut slot = slot.lock().await;
        if !slot.loaded {
            slot.value  = self.storage.load(identity).await?;
            slot.loaded = true;
            if slot.value.is_some() {
                tracing::info!("[teller] Loaded session from {} storage", self.storage.name());
            }
        }
        Ok(slot.value.clone())
    }

    /// Replace the session for `identity`, writing through to storage.
    pub async fn store(&self, identity: &str, session: Session) -> std::io::Result<()> {
        self.update(identity, Some(session)).await
    }

    /// Drop the session for `identity`, writing through to storage.
    pub async fn invalidate(&self, identity: &str) -> std::io::Result<()> {
        self.update(identity, None).await
    }

    async fn update(&self, identity: &str, value: Option<Session>) -> std::io::Result<()> {
        let slot = self.slot(identity).await;
        let mut slot = slot.lock().await;
        self.storage.upsert(identity, value.as_ref()).await?;
        slot.value  = value;
        slot.loaded = true;
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
