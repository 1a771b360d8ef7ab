use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use csap_server::session::{self, Server, SocketSink};
use csap_server::wire;
use tempfile::TempDir;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// A running server bound to an ephemeral local port, torn down when the
/// fixture (and its backing temp directory) is dropped.
pub struct Fixture {
    pub addr: SocketAddr,
    tempdir: TempDir,
}

impl Fixture {
    pub async fn start() -> Fixture {
        let tempdir = TempDir::new().expect("tempdir");
        let server = Server::init(tempdir.path().to_path_buf(), 128, 128).await.expect("server init");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            loop {
                let Ok((socket, _peer)) = listener.accept().await else { break };
                let server = server.clone();
                tokio::spawn(async move {
                    let (read_half, write_half) = socket.into_split();
                    let mut reader = BufReader::new(read_half);
                    let sink = Arc::new(SocketSink::new(write_half));
                    let _ = session::run(&server, &mut reader, sink).await;
                });
            }
        });

        Fixture { addr, tempdir }
    }

    pub fn root_path(&self) -> PathBuf {
        self.tempdir.path().to_path_buf()
    }

    pub async fn connect(&self) -> Client {
        let stream = TcpStream::connect(self.addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        Client { reader: BufReader::new(read_half), writer: write_half }
    }
}

/// One client connection, speaking the line + exact-size-blob wire protocol
/// directly (no framing helpers beyond what production clients would have).
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn send_line(&mut self, line: &str) {
        wire::write_line(&mut self.writer, line).await.expect("write line");
    }

    pub async fn send_blob(&mut self, data: &[u8]) {
        wire::send_blob(&mut self.writer, data).await.expect("send blob");
    }

    pub async fn read_line(&mut self) -> String {
        wire::read_line(&mut self.reader).await.expect("read line io").expect("unexpected eof")
    }

    pub async fn read_blob(&mut self, size: usize) -> Vec<u8> {
        wire::recv_blob(&mut self.reader, size).await.expect("read blob io")
    }
}

/// Create a user and log the connection in as them; returns the fixture
/// (kept alive for the caller) and the now-authenticated client.
pub async fn logged_in_as(name: &str, perm: &str) -> (Fixture, Client) {
    let fx = Fixture::start().await;
    let mut client = fx.connect().await;
    client.send_line(&format!("create_user {name} {perm}")).await;
    assert_eq!(client.read_line().await, "OK");
    client.send_line(&format!("login {name}")).await;
    assert_eq!(client.read_line().await, "OK");
    (fx, client)
}
