//! User Registry: tracks known users and the socket of whichever session is
//! currently logged in as them. The only blocking call
//! outside of I/O, [`UserRegistry::wait_for_active`], exists solely to let
//! `transfer_request` serialize against recipient presence.
//!
//! The registry is decoupled from the network layer: an active session is
//! represented by a [`NoticeSink`] trait object, so tests can register a
//! fake sink without opening a socket.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::{CsapError, CsapResult};
use crate::meta::MetadataStore;

/// A write-only sink for NOTICE lines pushed from another session.
#[async_trait]
pub trait NoticeSink: Send + Sync {
    /// Write one already-`\n`-terminated line. Best-effort: callers never
    /// treat a failure here as fatal to their own command.
    async fn send_line(&self, line: &str) -> CsapResult<()>;
}

/// Opaque identity distinguishing sessions so that an unregister from a
/// stale (already-replaced) session can't clobber a newer login.
pub type SessionId = u64;

struct UserRow {
    home: PathBuf,
    active: Option<(SessionId, Arc<dyn NoticeSink>)>,
}

struct Inner {
    root: PathBuf,
    users: HashMap<String, UserRow>,
    capacity: usize,
}

/// Process-wide table of users and their active session endpoints.
pub struct UserRegistry {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl UserRegistry {
    pub fn new(root: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { root: root.into(), users: HashMap::new(), capacity }),
            notify: Notify::new(),
        }
    }

    /// Pure concatenation `<root>/<name>`; does not verify existence.
    pub async fn home(&self, name: &str) -> PathBuf {
        self.inner.lock().await.root.join(name)
    }

    /// Ensure `<root>/<name>` exists with `perm & 0770`, write its metadata
    /// entry (owner = name), and insert a disabled table row if absent.
    /// Not authenticated; any caller may create a user.
    pub async fn create(&self, meta: &MetadataStore, name: &str, perm: u32) -> CsapResult<()> {
        let masked = perm & crate::meta::PERM_MASK;
        let home = self.home(name).await;
        tokio::fs::create_dir_all(&home).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&home, std::fs::Permissions::from_mode(masked)).await?;
        }
        meta.set(&home.to_string_lossy(), name, masked).await?;

        let mut inner = self.inner.lock().await;
        if !inner.users.contains_key(name) {
            if inner.users.len() >= inner.capacity {
                return Err(CsapError::busy("user table full"));
            }
            inner.users.insert(name.to_string(), UserRow { home, active: None });
        }
        Ok(())
    }

    /// Upsert a row and mark it active under `id`/`sink`; wakes any waiter.
    pub async fn register_active(&self, name: &str, id: SessionId, sink: Arc<dyn NoticeSink>) -> CsapResult<()> {
        let mut inner = self.inner.lock().await;
        let home = inner.root.join(name);
        if let Some(row) = inner.users.get_mut(name) {
            row.active = Some((id, sink));
        } else {
            if inner.users.len() >= inner.capacity {
                return Err(CsapError::busy("user table full"));
            }
            inner.users.insert(name.to_string(), UserRow { home, active: Some((id, sink)) });
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Clear the active endpoint for `name`, but only if it still belongs
    /// to session `id`. A later login must not be unregistered by a
    /// disconnecting, already-superseded session.
    pub async fn unregister_active(&self, name: &str, id: SessionId) {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.users.get_mut(name) {
            if matches!(&row.active, Some((active_id, _)) if *active_id == id) {
                row.active = None;
            }
        }
    }

    /// Currently active sink for `name`, if any.
    pub async fn active(&self, name: &str) -> Option<Arc<dyn NoticeSink>> {
        let inner = self.inner.lock().await;
        inner.users.get(name).and_then(|row| row.active.clone()).map(|(_, sink)| sink)
    }

    /// Block until `name` has an active session, then return its sink.
    /// The only blocking call outside I/O in this crate.
    ///
    /// Subscribes to `notify` before checking, not after: a `notify_waiters`
    /// that lands between the check and the `.await` would otherwise be
    /// missed entirely.
    pub async fn wait_for_active(&self, name: &str) -> Arc<dyn NoticeSink> {
        loop {
            let notified = self.notify.notified();
            if let Some(sink) = self.active(name).await {
                return sink;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingSink(AtomicUsize);
    #[async_trait]
    impl NoticeSink for CountingSink {
        async fn send_line(&self, _line: &str) -> CsapResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn create_then_home_round_trips() {
        let dir = TempDir::new().unwrap();
        let meta = MetadataStore::new(dir.path());
        meta.init().await.unwrap();
        let reg = UserRegistry::new(dir.path(), 128);
        reg.create(&meta, "alice", 0o770).await.unwrap();
        assert_eq!(reg.home("alice").await, dir.path().join("alice"));
        assert!(dir.path().join("alice").is_dir());
    }

    #[tokio::test]
    async fn register_then_active_round_trips() {
        let dir = TempDir::new().unwrap();
        let reg = UserRegistry::new(dir.path(), 128);
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        reg.register_active("alice", 1, sink.clone()).await.unwrap();
        let found = reg.active("alice").await.expect("active");
        found.send_line("hi\n").await.unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn relogin_replaces_previous_endpoint() {
        let dir = TempDir::new().unwrap();
        let reg = UserRegistry::new(dir.path(), 128);
        let first = Arc::new(CountingSink(AtomicUsize::new(0)));
        let second = Arc::new(CountingSink(AtomicUsize::new(0)));
        reg.register_active("alice", 1, first).await.unwrap();
        reg.register_active("alice", 2, second.clone()).await.unwrap();

        // the stale session (id 1) disconnecting must not clear the newer one
        reg.unregister_active("alice", 1).await;
        let active = reg.active("alice").await.expect("still active");
        active.send_line("x\n").await.unwrap();
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_for_active_unblocks_on_later_registration() {
        let dir = TempDir::new().unwrap();
        let reg = Arc::new(UserRegistry::new(dir.path(), 128));
        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.wait_for_active("bob").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        reg.register_active("bob", 1, sink).await.unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("no timeout")
            .expect("no join error");
        got.send_line("ok\n").await.unwrap();
    }
}
