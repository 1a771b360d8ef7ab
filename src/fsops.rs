//! Filesystem Operations: the per-command table of create/chmod/move/delete/
//! cd/list/read/write. Every operation resolves its path(s) (module A),
//! checks access (module B), acquires the appropriate side of the global
//! lock (module C), performs the syscall, updates metadata, and returns a
//! result for the session processor to render as a wire reply.
//!
//! `read`/`write` span the blob transfer itself inside the lock's critical
//! section, rather than just the `open`/`stat`, so a concurrent mutation
//! can never interleave with an in-flight transfer.

use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::error::{CsapError, CsapResult};
use crate::lock::LockManager;
use crate::meta::MetadataStore;
use crate::sandbox;
use crate::wire;

/// Default permission stamped on a file materialized by `write`/`upload`
/// when it didn't already exist.
const WRITE_CREATE_PERM: u32 = 0o700;

const READ_CHUNK: usize = 4096;

/// Caller identity and path scope shared by every operation below.
pub struct SessionCtx<'a> {
    pub root: &'a str,
    pub home: &'a str,
    pub user: &'a str,
}

/// Result of a successful `list`: one rendered line per entry, caller adds
/// the `OK`/`END` framing.
pub struct ListEntry {
    pub line: String,
}

/// Resolve `path` and enforce its boundary.
///
/// A relative `path` (no leading `/`) is always confined to `ctx.home`.
/// `..` can never be used to wander into another user's tree, regardless
/// of `allow_root`. An absolute `path` (explicit, not a traversal escape)
/// is confined to `ctx.home` unless `allow_root` permits root-wide
/// references (as `list` and `read`/`download` do); those still check the
/// result lies under `ctx.root` before handing it to the access-control
/// layer, which is what actually gates cross-user visibility.
fn resolve_for_user(ctx: &SessionCtx, cwd: &str, path: &str, allow_root: bool) -> CsapResult<String> {
    let full = sandbox::resolve(ctx.root, cwd, path)?;
    if allow_root && path.starts_with('/') {
        if !sandbox::is_within(ctx.root, &full) {
            return Err(CsapError::perm("path outside root"));
        }
    } else if !sandbox::is_within(ctx.home, &full) {
        return Err(CsapError::perm("path outside home"));
    }
    Ok(full)
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => "/",
    }
}

/// Last path segment, or the whole string if it has none (mirrors the
/// basename the broker uses to land a transferred file).
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or(path)
}

#[cfg(unix)]
async fn set_unix_perm(path: &str, perm: u32) -> CsapResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(perm)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_unix_perm(_path: &str, _perm: u32) -> CsapResult<()> {
    Ok(())
}

/// 10-char `drwxrwxrwx`-style string: `d`/`-` then owner/group/other bits.
/// Group bits are rendered but never consulted for access.
fn render_mode(is_dir: bool, perm: u32) -> String {
    let bits = [
        (perm & 0o400 != 0, 'r'),
        (perm & 0o200 != 0, 'w'),
        (perm & 0o100 != 0, 'x'),
        (perm & 0o040 != 0, 'r'),
        (perm & 0o020 != 0, 'w'),
        (perm & 0o010 != 0, 'x'),
        (perm & 0o004 != 0, 'r'),
        (perm & 0o002 != 0, 'w'),
        (perm & 0o001 != 0, 'x'),
    ];
    let mut out = String::with_capacity(10);
    out.push(if is_dir { 'd' } else { '-' });
    for (set, ch) in bits {
        out.push(if set { ch } else { '-' });
    }
    out
}

#[cfg(unix)]
pub(crate) fn os_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
pub(crate) fn os_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o000
}

pub async fn create(
    ctx: &SessionCtx<'_>,
    meta: &MetadataStore,
    lock: &LockManager,
    cwd: &str,
    path: &str,
    is_dir: bool,
    perm: u32,
) -> CsapResult<()> {
    let full = resolve_for_user(ctx, cwd, path, false)?;
    let masked = perm & crate::meta::PERM_MASK;
    meta.check_access(parent_of(&full), ctx.user, false, true, true).await?;

    let _guard = lock.write().await;
    if is_dir {
        tokio::fs::create_dir(&full).await?;
        set_unix_perm(&full, masked).await?;
    } else {
        let file = tokio::fs::OpenOptions::new().write(true).create_new(true).open(&full).await?;
        drop(file);
        set_unix_perm(&full, masked).await?;
    }
    meta.set(&full, ctx.user, masked).await?;
    Ok(())
}

pub async fn chmod(
    ctx: &SessionCtx<'_>,
    meta: &MetadataStore,
    lock: &LockManager,
    cwd: &str,
    path: &str,
    perm: u32,
) -> CsapResult<()> {
    let full = resolve_for_user(ctx, cwd, path, false)?;
    let masked = perm & crate::meta::PERM_MASK;
    if !meta.is_owner(&full, ctx.user).await? {
        return Err(CsapError::perm("chmod requires ownership"));
    }

    let _guard = lock.write().await;
    set_unix_perm(&full, masked).await?;
    meta.set(&full, ctx.user, masked).await?;
    Ok(())
}

pub async fn move_path(
    ctx: &SessionCtx<'_>,
    meta: &MetadataStore,
    lock: &LockManager,
    cwd: &str,
    src: &str,
    dst: &str,
) -> CsapResult<()> {
    let full_src = resolve_for_user(ctx, cwd, src, false)?;
    let full_dst = resolve_for_user(ctx, cwd, dst, false)?;
    meta.check_access(parent_of(&full_src), ctx.user, false, true, true).await?;
    meta.check_access(parent_of(&full_dst), ctx.user, false, true, true).await?;

    let _guard = lock.write().await;
    tokio::fs::rename(&full_src, &full_dst).await?;
    meta.move_path(&full_src, &full_dst).await?;
    Ok(())
}

pub async fn delete(
    ctx: &SessionCtx<'_>,
    meta: &MetadataStore,
    lock: &LockManager,
    cwd: &str,
    path: &str,
) -> CsapResult<()> {
    let full = resolve_for_user(ctx, cwd, path, false)?;
    meta.check_access(parent_of(&full), ctx.user, false, true, true).await?;

    let _guard = lock.write().await;
    tokio::fs::remove_file(&full).await?;
    meta.remove(&full).await?;
    Ok(())
}

/// Returns the new `cwd` on success; the session processor stores it.
pub async fn cd(
    ctx: &SessionCtx<'_>,
    meta: &MetadataStore,
    lock: &LockManager,
    cwd: &str,
    path: &str,
) -> CsapResult<String> {
    let full = resolve_for_user(ctx, cwd, path, false)?;
    meta.check_access(&full, ctx.user, false, false, true).await?;

    let _guard = lock.read().await;
    let info = tokio::fs::metadata(&full).await.map_err(|_| CsapError::not_found("not a directory"))?;
    if !info.is_dir() {
        return Err(CsapError::not_found("not a directory"));
    }
    Ok(full)
}

pub async fn list(
    ctx: &SessionCtx<'_>,
    meta: &MetadataStore,
    lock: &LockManager,
    cwd: &str,
    path: &str,
) -> CsapResult<Vec<ListEntry>> {
    let full = resolve_for_user(ctx, cwd, path, true)?;
    meta.check_access(&full, ctx.user, true, false, true).await?;

    let _guard = lock.read().await;
    let mut read_dir = tokio::fs::read_dir(&full).await?;
    let mut out = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "." || name == ".." {
            continue;
        }
        let entry_path = format!("{full}/{name}");
        let info = entry.metadata().await?;
        let perm = match meta.get(&entry_path).await {
            Ok((_, perm)) => perm,
            Err(_) => os_mode(&info),
        };
        let mode = render_mode(info.is_dir(), perm);
        out.push(ListEntry { line: format!("{mode} {} {name}", info.len()) });
    }
    Ok(out)
}

/// Open `path` for reading at `offset`, writing the `OK <remaining>` line
/// then streaming exactly that many bytes to `writer`. Held under the read
/// lock for the whole transfer.
///
/// Root-scoped like `list`: an absolute path may reference another user's
/// tree, gated by the other-triad permission bit rather than the home
/// boundary (that bit would otherwise be unreachable dead weight).
pub async fn read(
    ctx: &SessionCtx<'_>,
    meta: &MetadataStore,
    lock: &LockManager,
    cwd: &str,
    path: &str,
    offset: u64,
    writer: &mut (impl AsyncWrite + Unpin),
) -> CsapResult<()> {
    let full = resolve_for_user(ctx, cwd, path, true)?;
    meta.check_access(&full, ctx.user, true, false, false).await?;

    let _guard = lock.read().await;
    let mut file = tokio::fs::File::open(&full).await?;
    let size = file.metadata().await?.len();
    let offset = offset.min(size);
    tokio::io::AsyncSeekExt::seek(&mut file, std::io::SeekFrom::Start(offset)).await?;
    let remaining = size - offset;

    wire::write_line(writer, &format!("OK {remaining}")).await?;

    let mut left = remaining;
    let mut buf = vec![0u8; READ_CHUNK];
    while left > 0 {
        let chunk = (left as usize).min(READ_CHUNK);
        tokio::io::AsyncReadExt::read_exact(&mut file, &mut buf[..chunk]).await?;
        wire::send_blob(writer, &buf[..chunk]).await?;
        left -= chunk as u64;
    }
    Ok(())
}

/// Receive exactly `size` bytes from `reader` and write them into `path` at
/// `offset`, creating the file (perm 0700) if absent. Held under the write
/// lock for the whole transfer.
pub async fn write(
    ctx: &SessionCtx<'_>,
    meta: &MetadataStore,
    lock: &LockManager,
    cwd: &str,
    path: &str,
    offset: u64,
    size: u64,
    reader: &mut (impl AsyncBufRead + Unpin),
) -> CsapResult<u64> {
    let full = resolve_for_user(ctx, cwd, path, false)?;
    let existed = tokio::fs::try_exists(&full).await?;
    if existed {
        meta.check_access(&full, ctx.user, false, true, false).await?;
    } else {
        meta.check_access(parent_of(&full), ctx.user, false, true, true).await?;
    }

    let _guard = lock.write().await;
    let mut file = tokio::fs::OpenOptions::new().write(true).create(true).open(&full).await?;
    if !existed {
        set_unix_perm(&full, WRITE_CREATE_PERM).await?;
    }
    tokio::io::AsyncSeekExt::seek(&mut file, std::io::SeekFrom::Start(offset)).await?;

    let mut left = size;
    while left > 0 {
        let chunk = left.min(READ_CHUNK as u64) as usize;
        let bytes = wire::recv_blob(reader, chunk).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &bytes).await?;
        left -= chunk as u64;
    }

    if !existed {
        meta.set(&full, ctx.user, WRITE_CREATE_PERM).await?;
    }
    Ok(size)
}
