// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Debounced JSON persistence for sessions.
//!
//! Sessions live at `<workspace>/.popilot/sessions/<id>.json` with an atomic
//! `last-session-id.txt` pointer used for auto-restoration at startup.
//! Mutations during a turn are frequent, so writes are debounced: only the
//! newest snapshot within the window reaches disk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, warn};

use popilot_tools::fsio::atomic_write;

use crate::Session;

const POINTER_FILE: &str = "last-session-id.txt";

struct Inner {
    dir: PathBuf,
    debounce: Duration,
    retention: usize,
    /// Newest snapshot awaiting its debounce window.
    pending: Mutex<Option<Session>>,
    /// Bumped on every schedule; a sleeper only writes if still newest.
    generation: AtomicU64,
}

/// Cheaply cloneable handle; all clones share one pending snapshot and
/// generation counter.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    pub fn new(workspace: &Path, debounce_ms: u64, retention: usize) -> anyhow::Result<Self> {
        let dir = workspace.join(".popilot").join("sessions");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating session dir {}", dir.display()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                debounce: Duration::from_millis(debounce_ms),
                retention,
                pending: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.inner.dir.join(format!("{id}.json"))
    }

    /// Write one session (and the restoration pointer) immediately.
    pub async fn save_now(&self, session: &Session) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(session)?;
        atomic_write(&self.session_path(&session.id), json.as_bytes())
            .await
            .with_context(|| format!("saving session {}", session.id))?;
        atomic_write(&self.inner.dir.join(POINTER_FILE), session.id.as_bytes())
            .await
            .context("updating last-session pointer")?;
        debug!(id = %session.id, "session saved");
        self.prune().await;
        Ok(())
    }

    /// Schedule a debounced save of this snapshot.  A newer schedule within
    /// the window supersedes it.
    pub fn schedule_save(&self, session: &Session) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.pending.lock().unwrap() = Some(session.clone());

        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(store.inner.debounce).await;
            if store.inner.generation.load(Ordering::SeqCst) != generation {
                return; // superseded
            }
            let snapshot = store.inner.pending.lock().unwrap().take();
            if let Some(session) = snapshot {
                if let Err(e) = store.save_now(&session).await {
                    warn!("debounced session save failed: {e}");
                }
            }
        });
    }

    /// Flush any pending debounced snapshot right now (used on shutdown).
    pub async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.inner.pending.lock().unwrap().take();
        if let Some(session) = snapshot {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.save_now(&session).await?;
        }
        Ok(())
    }

    pub async fn load(&self, id: &str) -> anyhow::Result<Session> {
        let path = self.session_path(id);
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// The session the pointer file names, if it still exists.
    pub async fn load_last(&self) -> Option<Session> {
        let id = tokio::fs::read_to_string(self.inner.dir.join(POINTER_FILE))
            .await
            .ok()?;
        self.load(id.trim()).await.ok()
    }

    /// Drop everything beyond the newest `retention` sessions (by
    /// `updated_at`).
    async fn prune(&self) {
        let mut entries: Vec<(PathBuf, chrono::DateTime<chrono::Utc>)> = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.inner.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(text) = tokio::fs::read_to_string(&path).await {
                    if let Ok(session) = serde_json::from_str::<Session>(&text) {
                        entries.push((path, session.updated_at));
                    }
                }
            }
        }
        if entries.len() <= self.inner.retention {
            return;
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        for (path, _) in entries.into_iter().skip(self.inner.retention) {
            debug!(path = %path.display(), "pruning old session");
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
