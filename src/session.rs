//! Session Processor: one task per connection, dispatching line commands
//! against the shared components.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{CsapError, CsapResult};
use crate::fsops::{self, SessionCtx};
use crate::lock::LockManager;
use crate::meta::MetadataStore;
use crate::registry::{NoticeSink, SessionId, UserRegistry};
use crate::transfer::TransferBroker;
use crate::wire;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared, process-wide components every session dispatches against.
pub struct Server {
    pub root: PathBuf,
    pub meta: MetadataStore,
    pub lock: LockManager,
    pub registry: UserRegistry,
    pub broker: TransferBroker,
}

impl Server {
    pub async fn init(root: PathBuf, max_users: usize, max_transfers: usize) -> CsapResult<Arc<Server>> {
        let meta = MetadataStore::new(&root);
        meta.init().await?;
        Ok(Arc::new(Server {
            registry: UserRegistry::new(&root, max_users),
            broker: TransferBroker::new(max_transfers),
            lock: LockManager::new(),
            meta,
            root,
        }))
    }
}

/// Adapts a socket's write half into a [`NoticeSink`] so the registry and
/// broker can push `NOTICE` lines without knowing about sockets directly.
pub struct SocketSink<W> {
    writer: Mutex<W>,
}

impl<W> SocketSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer) }
    }

    /// Exclusive access to the underlying writer, so a session's own reply
    /// (which may be several lines plus a blob) and a `NOTICE` pushed from
    /// another task never interleave mid-write.
    async fn lock(&self) -> MutexGuard<'_, W> {
        self.writer.lock().await
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> NoticeSink for SocketSink<W> {
    async fn send_line(&self, line: &str) -> CsapResult<()> {
        wire::write_line(&mut *self.lock().await, line).await
    }
}

/// Per-connection state: identity once logged in, and the working directory.
struct Session {
    id: SessionId,
    user: Option<String>,
    home: Option<String>,
    cwd: String,
    logged_in: bool,
}

/// Drive one connection to completion: read lines from `reader`, dispatch,
/// write replies through `sink`, until EOF or `exit`. `sink` is also handed
/// to the registry/broker as the [`NoticeSink`] this session receives
/// `NOTICE` pushes on, so replies and pushes always serialize through the
/// same socket-write mutex.
pub async fn run<W: AsyncWrite + Unpin + Send>(
    server: &Server,
    reader: &mut (impl AsyncBufRead + Unpin + Send),
    sink: Arc<SocketSink<W>>,
) -> CsapResult<()> {
    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    let root_str = server.root.to_string_lossy().into_owned();
    let mut session =
        Session { id, user: None, home: None, cwd: root_str.clone(), logged_in: false };
    let notice_sink: Arc<dyn NoticeSink> = sink.clone();

    loop {
        let Some(line) = wire::read_line(reader).await? else { break };
        let tokens: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();
        let Some(&cmd) = tokens.first() else {
            wire::write_line(&mut *sink.lock().await, &CsapError::invalid("empty command").to_string()).await?;
            continue;
        };
        let args = &tokens[1..];

        if cmd == "exit" {
            wire::write_line(&mut *sink.lock().await, "OK").await?;
            break;
        }

        let mut writer = sink.lock().await;
        let outcome = dispatch(server, &mut session, cmd, args, reader, &mut *writer, &notice_sink).await;
        if let Err(err) = outcome {
            wire::write_line(&mut *writer, &err.to_string()).await?;
        }
    }

    if let Some(user) = &session.user {
        server.registry.unregister_active(user, session.id).await;
    }
    Ok(())
}

fn require_login<'a>(session: &'a Session) -> CsapResult<(&'a str, &'a str)> {
    match (&session.user, &session.home) {
        (Some(user), Some(home)) => Ok((user.as_str(), home.as_str())),
        _ => Err(CsapError::perm("login required")),
    }
}

fn parse_octal_perm(s: &str) -> CsapResult<u32> {
    if s.is_empty() || !s.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return Err(CsapError::invalid("bad octal permission"));
    }
    let val = u32::from_str_radix(s, 8).map_err(|_| CsapError::invalid("bad octal permission"))?;
    if val > 0o777 {
        return Err(CsapError::invalid("permission out of range"));
    }
    Ok(val)
}

/// Accepts `-offset=N` as a single token or `-o set=N` as two tokens;
/// returns the remaining args with the offset option stripped.
fn parse_offset<'a>(args: &'a [&'a str]) -> (u64, &'a [&'a str]) {
    if let Some(rest) = args.first().and_then(|t| t.strip_prefix("-offset=")) {
        if let Ok(n) = rest.parse() {
            return (n, &args[1..]);
        }
    }
    if args.len() >= 2 && args[0] == "-o" {
        if let Some(rest) = args[1].strip_prefix("set=") {
            if let Ok(n) = rest.parse() {
                return (n, &args[2..]);
            }
        }
    }
    (0, args)
}

async fn dispatch(
    server: &Server,
    session: &mut Session,
    cmd: &str,
    args: &[&str],
    reader: &mut (impl AsyncBufRead + Unpin + Send),
    writer: &mut (impl AsyncWrite + Unpin + Send),
    notice_sink: &Arc<dyn NoticeSink>,
) -> CsapResult<()> {
    match cmd {
        "help" => {
            wire::write_line(writer, "OK").await?;
            for line in HELP_LINES {
                wire::write_line(writer, line).await?;
            }
            wire::write_line(writer, "END").await?;
            Ok(())
        }
        "create_user" => {
            let [user, perm_str] = args else {
                return Err(CsapError::invalid("usage: create_user <name> <perm>"));
            };
            let perm = parse_octal_perm(perm_str)?;
            server.registry.create(&server.meta, user, perm).await?;
            wire::write_line(writer, "OK").await
        }
        "login" => {
            let [user] = args else { return Err(CsapError::invalid("usage: login <name>")) };
            let home = server.registry.home(user).await;
            let info = tokio::fs::metadata(&home).await.map_err(|_| CsapError::not_found("user home not found"))?;
            if !info.is_dir() {
                return Err(CsapError::not_found("user home not found"));
            }
            let home_str = home.to_string_lossy().into_owned();
            if server.meta.get(&home_str).await.is_err() {
                server.meta.set(&home_str, user, fsops::os_mode(&info) & 0o770).await?;
            }
            session.user = Some(user.to_string());
            session.home = Some(home_str.clone());
            session.cwd = home_str;
            session.logged_in = true;
            server.registry.register_active(user, session.id, notice_sink.clone()).await?;
            wire::write_line(writer, "OK").await
        }
        "logout" => {
            if let Some(user) = session.user.take() {
                server.registry.unregister_active(&user, session.id).await;
            }
            session.home = None;
            session.logged_in = false;
            wire::write_line(writer, "OK").await
        }
        "whoami" => {
            let name = session.user.as_deref().unwrap_or("none");
            wire::write_line(writer, &format!("OK {name}")).await
        }
        "create" => {
            let (user, home) = require_login(session)?;
            let ctx = SessionCtx { root: &server.root.to_string_lossy(), home, user };
            let (is_dir, path, perm_str) = match args {
                ["-d", path, perm] => (true, *path, *perm),
                [path, perm] => (false, *path, *perm),
                _ => return Err(CsapError::invalid("usage: create [-d] <path> <perm>")),
            };
            let perm = parse_octal_perm(perm_str)?;
            fsops::create(&ctx, &server.meta, &server.lock, &session.cwd, path, is_dir, perm).await?;
            wire::write_line(writer, "OK").await
        }
        "chmod" => {
            let (user, home) = require_login(session)?;
            let ctx = SessionCtx { root: &server.root.to_string_lossy(), home, user };
            let [path, perm_str] = args else { return Err(CsapError::invalid("usage: chmod <path> <perm>")) };
            let perm = parse_octal_perm(perm_str)?;
            fsops::chmod(&ctx, &server.meta, &server.lock, &session.cwd, path, perm).await?;
            wire::write_line(writer, "OK").await
        }
        "move" => {
            let (user, home) = require_login(session)?;
            let ctx = SessionCtx { root: &server.root.to_string_lossy(), home, user };
            let [src, dst] = args else { return Err(CsapError::invalid("usage: move <src> <dst>")) };
            fsops::move_path(&ctx, &server.meta, &server.lock, &session.cwd, src, dst).await?;
            wire::write_line(writer, "OK").await
        }
        "delete" => {
            let (user, home) = require_login(session)?;
            let ctx = SessionCtx { root: &server.root.to_string_lossy(), home, user };
            let [path] = args else { return Err(CsapError::invalid("usage: delete <path>")) };
            fsops::delete(&ctx, &server.meta, &server.lock, &session.cwd, path).await?;
            wire::write_line(writer, "OK").await
        }
        "cd" => {
            let (user, home) = require_login(session)?;
            let ctx = SessionCtx { root: &server.root.to_string_lossy(), home, user };
            let [path] = args else { return Err(CsapError::invalid("usage: cd <path>")) };
            let new_cwd = fsops::cd(&ctx, &server.meta, &server.lock, &session.cwd, path).await?;
            session.cwd = new_cwd;
            wire::write_line(writer, "OK").await
        }
        "list" => {
            let (user, home) = require_login(session)?;
            let ctx = SessionCtx { root: &server.root.to_string_lossy(), home, user };
            let path = args.first().copied().unwrap_or(".");
            let entries = fsops::list(&ctx, &server.meta, &server.lock, &session.cwd, path).await?;
            wire::write_line(writer, "OK").await?;
            for entry in entries {
                wire::write_line(writer, &entry.line).await?;
            }
            wire::write_line(writer, "END").await
        }
        "read" => {
            let (user, home) = require_login(session)?;
            let ctx = SessionCtx { root: &server.root.to_string_lossy(), home, user };
            let (offset, rest) = parse_offset(args);
            let [path] = rest else { return Err(CsapError::invalid("usage: read [-offset=n|-o set=n] <path>")) };
            fsops::read(&ctx, &server.meta, &server.lock, &session.cwd, path, offset, writer).await
        }
        "download" => {
            let (user, home) = require_login(session)?;
            let ctx = SessionCtx { root: &server.root.to_string_lossy(), home, user };
            let [path] = args else { return Err(CsapError::invalid("usage: download <path>")) };
            fsops::read(&ctx, &server.meta, &server.lock, &session.cwd, path, 0, writer).await
        }
        "write" => {
            let (user, home) = require_login(session)?;
            let ctx = SessionCtx { root: &server.root.to_string_lossy(), home, user };
            let (offset, rest) = parse_offset(args);
            let [path, size_str] = rest else {
                return Err(CsapError::invalid("usage: write [-offset=n|-o set=n] <path> <size>"));
            };
            let size: u64 = size_str.parse().map_err(|_| CsapError::invalid("bad size"))?;
            let written = fsops::write(&ctx, &server.meta, &server.lock, &session.cwd, path, offset, size, reader).await?;
            wire::write_line(writer, &format!("OK {written}")).await
        }
        "upload" => {
            let (user, home) = require_login(session)?;
            let ctx = SessionCtx { root: &server.root.to_string_lossy(), home, user };
            let [path, size_str] = args else { return Err(CsapError::invalid("usage: upload <path> <size>")) };
            let size: u64 = size_str.parse().map_err(|_| CsapError::invalid("bad size"))?;
            let written = fsops::write(&ctx, &server.meta, &server.lock, &session.cwd, path, 0, size, reader).await?;
            wire::write_line(writer, &format!("OK {written}")).await
        }
        "transfer_request" => {
            let (user, _home) = require_login(session)?;
            let user = user.to_string();
            let [file, dest_user] = args else {
                return Err(CsapError::invalid("usage: transfer_request <file> <dest_user>"));
            };
            let home = session.home.clone().expect("checked by require_login");
            let root = server.root.to_string_lossy().into_owned();
            let cwd = session.cwd.clone();
            let mut waiting_sent = false;
            let (id, _recipient) = server
                .broker
                .request(&server.registry, &user, &root, &cwd, &home, file, dest_user, || {
                    waiting_sent = true;
                })
                .await?;
            if waiting_sent {
                wire::write_line(writer, "WAITING").await?;
            }
            wire::write_line(writer, &format!("OK {id}")).await
        }
        "accept" => {
            let (user, _home) = require_login(session)?;
            let user = user.to_string();
            let [dir, id_str] = args else { return Err(CsapError::invalid("usage: accept <dir> <id>")) };
            let id: u64 = id_str.parse().map_err(|_| CsapError::invalid("bad id"))?;
            let home = session.home.clone().expect("checked by require_login");
            let root = server.root.to_string_lossy().into_owned();
            let cwd = session.cwd.clone();
            let _dest = server
                .broker
                .accept(&server.registry, &server.lock, &server.meta, &user, &root, &cwd, &home, id, dir)
                .await?;
            wire::write_line(writer, "OK").await
        }
        "reject" => {
            let (user, _home) = require_login(session)?;
            let user = user.to_string();
            let [id_str] = args else { return Err(CsapError::invalid("usage: reject <id>")) };
            let id: u64 = id_str.parse().map_err(|_| CsapError::invalid("bad id"))?;
            server.broker.reject(&server.registry, &user, id).await?;
            wire::write_line(writer, "OK").await
        }
        _ => Err(CsapError::Unsupported(format!("unknown command: {cmd}"))),
    }
}

const HELP_LINES: &[&str] = &[
    "exit",
    "create_user <name> <perm>",
    "login <name>",
    "logout",
    "whoami",
    "create [-d] <path> <perm>",
    "chmod <path> <perm>",
    "move <src> <dst>",
    "delete <path>",
    "cd <path>",
    "list [path]",
    "read [-offset=n | -o set=n] <path>",
    "write [-offset=n | -o set=n] <path> <size>",
    "upload <path> <size>",
    "download <path>",
    "transfer_request <file> <dest_user>",
    "accept <dir> <id>",
    "reject <id>",
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::BufReader;

    async fn setup() -> (TempDir, Arc<Server>) {
        let dir = TempDir::new().unwrap();
        let server = Server::init(dir.path().to_path_buf(), 128, 128).await.unwrap();
        (dir, server)
    }

    async fn roundtrip(server: &Server, input: &str) -> String {
        let mut reader = BufReader::new(std::io::Cursor::new(input.as_bytes().to_vec()));
        let sink = Arc::new(SocketSink::new(Vec::new()));
        run(server, &mut reader, sink.clone()).await.unwrap();
        let out = sink.lock().await;
        String::from_utf8(out.clone()).unwrap()
    }

    #[tokio::test]
    async fn create_user_then_login_then_whoami() {
        let (_dir, server) = setup().await;
        let out = roundtrip(
            &server,
            "create_user alice 0770\nlogin alice\nwhoami\nexit\n",
        )
        .await;
        assert_eq!(out, "OK\nOK\nOK alice\nOK\n");
    }

    #[tokio::test]
    async fn unknown_command_is_unsupported() {
        let (_dir, server) = setup().await;
        let out = roundtrip(&server, "bogus\nexit\n").await;
        assert!(out.starts_with("ERR 7 UNSUPPORTED"));
    }

    #[tokio::test]
    async fn fs_commands_require_login() {
        let (_dir, server) = setup().await;
        let out = roundtrip(&server, "list\nexit\n").await;
        assert!(out.starts_with("ERR 3 PERM"));
    }

    #[tokio::test]
    async fn create_write_read_cycle() {
        let (_dir, server) = setup().await;
        let script = "create_user alice 0770\nlogin alice\nwrite note.txt 5\nhelloread note.txt\nexit\n";
        let out = roundtrip(&server, script).await;
        assert!(out.contains("OK 5"));
        assert!(out.contains("OK 5\nhello"));
    }

    #[tokio::test]
    async fn bad_octal_perm_is_invalid() {
        let (_dir, server) = setup().await;
        let out = roundtrip(&server, "create_user alice 999\nexit\n").await;
        assert!(out.starts_with("ERR 1 INVALID"));
    }
}
