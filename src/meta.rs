//! Metadata Store: persists `{path -> (owner, perm)}` in a single
//! tab-separated file, rewritten in full via write-tmp+rename on every
//! mutation. Callers serialize concurrent mutations through
//! the [`crate::lock::LockManager`]; this module only guarantees that a
//! reader never observes a half-written file.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{CsapError, CsapResult};

/// Mask applied to every stored/queried permission: owner + other triads.
/// The middle (group) triad is preserved on disk but never consulted.
pub const PERM_MASK: u32 = 0o770;

const META_FILE_NAME: &str = ".csap_meta";

/// Synthetic owner of the root directory's metadata entry.
pub const ROOT_OWNER: &str = "root";
/// Permission bits of the root directory's metadata entry.
pub const ROOT_PERM: u32 = 0o750;

/// One `{path, owner, perm}` row of the metadata file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaEntry {
    pub path: String,
    pub owner: String,
    pub perm: u32,
}

/// Handle to the on-disk metadata file for one server root.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join(META_FILE_NAME)
    }

    async fn load(&self) -> CsapResult<Vec<MetaEntry>> {
        let raw = match fs::read_to_string(self.meta_path()).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        for line in raw.lines() {
            let mut parts = line.splitn(3, '\t');
            let (Some(path), Some(owner), Some(perm_str)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(perm) = u32::from_str_radix(perm_str, 8) else { continue };
            entries.push(MetaEntry { path: path.to_string(), owner: owner.to_string(), perm: perm & PERM_MASK });
        }
        Ok(entries)
    }

    async fn save(&self, entries: &[MetaEntry]) -> CsapResult<()> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&format!("{}\t{}\t{:o}\n", entry.path, entry.owner, entry.perm & PERM_MASK));
        }

        let tmp_path = self.meta_path().with_extension("tmp");
        fs::write(&tmp_path, buf).await?;
        fs::rename(&tmp_path, self.meta_path()).await?;
        Ok(())
    }

    /// Create `<root>/.csap_meta` if absent, ensuring a root entry owned by
    /// `root` with perm 0750. Idempotent.
    pub async fn init(&self) -> CsapResult<()> {
        fs::create_dir_all(&self.root).await?;
        let mut entries = self.load().await?;
        let root_path = self.root.to_string_lossy().into_owned();
        if !entries.iter().any(|e| e.path == root_path) {
            entries.push(MetaEntry { path: root_path, owner: ROOT_OWNER.to_string(), perm: ROOT_PERM });
            self.save(&entries).await?;
        }
        Ok(())
    }

    /// Fetch `(owner, perm)` for `path`, or `NotFound`.
    pub async fn get(&self, path: &str) -> CsapResult<(String, u32)> {
        let entries = self.load().await?;
        entries
            .into_iter()
            .find(|e| e.path == path)
            .map(|e| (e.owner, e.perm))
            .ok_or_else(|| CsapError::not_found(format!("no metadata for {path}")))
    }

    /// Insert or update the entry for `path`.
    pub async fn set(&self, path: &str, owner: &str, perm: u32) -> CsapResult<()> {
        let mut entries = self.load().await?;
        let masked = perm & PERM_MASK;
        if let Some(existing) = entries.iter_mut().find(|e| e.path == path) {
            existing.owner = owner.to_string();
            existing.perm = masked;
        } else {
            entries.push(MetaEntry { path: path.to_string(), owner: owner.to_string(), perm: masked });
        }
        self.save(&entries).await
    }

    /// Delete the entry for `path`. Missing is a no-op success.
    pub async fn remove(&self, path: &str) -> CsapResult<()> {
        let mut entries = self.load().await?;
        entries.retain(|e| e.path != path);
        self.save(&entries).await
    }

    /// Rename `old` and every descendant whose path has `old` as a proper
    /// parent (prefix match followed by `/` or end).
    pub async fn move_path(&self, old: &str, new: &str) -> CsapResult<()> {
        let mut entries = self.load().await?;
        for entry in entries.iter_mut() {
            if entry.path == old {
                entry.path = new.to_string();
            } else if let Some(suffix) = entry.path.strip_prefix(old) {
                if suffix.starts_with('/') {
                    entry.path = format!("{new}{suffix}");
                }
            }
        }
        self.save(&entries).await
    }

    /// Evaluate an access request against the owner/other triad.
    ///
    /// Selects the owner triad iff `user == owner`, the other triad
    /// otherwise. A missing entry denies access.
    pub async fn check_access(
        &self,
        path: &str,
        user: &str,
        need_r: bool,
        need_w: bool,
        need_x: bool,
    ) -> CsapResult<()> {
        let (owner, perm) = self.get(path).await.map_err(|_| CsapError::perm("permission denied"))?;
        let is_owner = user == owner;
        let (r_bit, w_bit, x_bit) = if is_owner { (0o400, 0o200, 0o100) } else { (0o040, 0o020, 0o010) };

        if need_r && perm & r_bit == 0 {
            return Err(CsapError::perm("permission denied"));
        }
        if need_w && perm & w_bit == 0 {
            return Err(CsapError::perm("permission denied"));
        }
        if need_x && perm & x_bit == 0 {
            return Err(CsapError::perm("permission denied"));
        }
        Ok(())
    }

    /// True iff `user` is the recorded owner of `path`.
    pub async fn is_owner(&self, path: &str, user: &str) -> CsapResult<bool> {
        let (owner, _) = self.get(path).await?;
        Ok(owner == user)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
