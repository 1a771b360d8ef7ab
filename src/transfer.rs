//! Transfer Broker: pending peer-to-peer transfer requests plus the
//! approved copy. A bounded table guarded by its own mutex, independent of
//! the global filesystem lock; the broker mutex and the registry mutex
//! are never held simultaneously.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{CsapError, CsapResult};
use crate::lock::LockManager;
use crate::meta::MetadataStore;
use crate::registry::{NoticeSink, UserRegistry};
use crate::sandbox;

/// Default owner permission stamped on a file created by `accept`.
const ACCEPTED_FILE_PERM: u32 = 0o700;

/// One outstanding transfer request.
#[derive(Debug, Clone)]
struct PendingTransfer {
    from_user: String,
    to_user: String,
    source_path: String,
}

struct Inner {
    requests: HashMap<u64, PendingTransfer>,
    next_id: u64,
    capacity: usize,
}

/// Coordinates `transfer_request` / `accept` / `reject`.
pub struct TransferBroker {
    inner: Mutex<Inner>,
}

impl TransferBroker {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(Inner { requests: HashMap::new(), next_id: 1, capacity }) }
    }

    /// Submit a request to send `file` (resolved under `cwd`, must lie
    /// within `home`) to `dest_user`. Blocks on [`UserRegistry::wait_for_active`]
    /// if the recipient is not yet connected, after emitting `WAITING` via
    /// `notify_waiting`. Returns the allocated id once the request has been
    /// queued and the recipient notified.
    pub async fn request(
        &self,
        registry: &UserRegistry,
        from_user: &str,
        root: &str,
        cwd: &str,
        home: &str,
        file: &str,
        dest_user: &str,
        notify_waiting: impl FnOnce(),
    ) -> CsapResult<(u64, Arc<dyn NoticeSink>)> {
        let source_path = sandbox::resolve(root, cwd, file)?;
        if !sandbox::is_within(home, &source_path) {
            return Err(CsapError::perm("path outside home"));
        }

        let recipient_sink = match registry.active(dest_user).await {
            Some(sink) => sink,
            None => {
                notify_waiting();
                registry.wait_for_active(dest_user).await
            }
        };

        let id = {
            let mut inner = self.inner.lock().await;
            if inner.requests.len() >= inner.capacity {
                return Err(CsapError::busy("too many pending transfers"));
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.requests.insert(
                id,
                PendingTransfer {
                    from_user: from_user.to_string(),
                    to_user: dest_user.to_string(),
                    source_path,
                },
            );
            id
        };

        let line = format!("NOTICE TRANSFER {id} {from_user} {file}\n");
        let _ = recipient_sink.send_line(&line).await;

        Ok((id, recipient_sink))
    }

    /// Approve request `id` as its recipient (`sess_user`); copy the source
    /// file into `dir` (resolved under `cwd`, must lie within `home`) and
    /// record a metadata entry for the new file owned by the recipient.
    pub async fn accept(
        &self,
        registry: &UserRegistry,
        lock: &LockManager,
        meta: &MetadataStore,
        sess_user: &str,
        root: &str,
        cwd: &str,
        home: &str,
        id: u64,
        dir: &str,
    ) -> CsapResult<String> {
        let request = self.take_request(sess_user, id).await?;

        let dest_dir = sandbox::resolve(root, cwd, dir)?;
        if !sandbox::is_within(home, &dest_dir) {
            return Err(CsapError::perm("path outside home"));
        }

        let dest_path = format!("{dest_dir}/{}", crate::fsops::basename(&request.source_path));

        {
            let _guard = lock.write().await;
            tokio::fs::copy(&request.source_path, &dest_path).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&dest_path, std::fs::Permissions::from_mode(ACCEPTED_FILE_PERM))
                    .await?;
            }
            meta.set(&dest_path, sess_user, ACCEPTED_FILE_PERM).await?;
        }

        if let Some(sender_sink) = registry.active(&request.from_user).await {
            let line = format!("NOTICE TRANSFER_ACCEPTED {id} {dest_path}\n");
            let _ = sender_sink.send_line(&line).await;
        }

        Ok(dest_path)
    }

    /// Reject request `id` as its recipient. No file I/O; notifies the
    /// sender if still connected.
    pub async fn reject(&self, registry: &UserRegistry, sess_user: &str, id: u64) -> CsapResult<()> {
        let request = self.take_request(sess_user, id).await?;
        if let Some(sender_sink) = registry.active(&request.from_user).await {
            let line = format!("NOTICE TRANSFER_REJECTED {id}\n");
            let _ = sender_sink.send_line(&line).await;
        }
        Ok(())
    }

    /// Remove and return request `id`, authorizing that `sess_user` is its
    /// recipient. Visible to accept/reject only between submission and the
    /// first matching call.
    async fn take_request(&self, sess_user: &str, id: u64) -> CsapResult<PendingTransfer> {
        let mut inner = self.inner.lock().await;
        let request = inner.requests.get(&id).ok_or_else(|| CsapError::not_found("invalid id"))?;
        if request.to_user != sess_user {
            return Err(CsapError::perm("not recipient"));
        }
        Ok(inner.requests.remove(&id).expect("just checked presence"))
    }
}
