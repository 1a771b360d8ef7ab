use std::sync::Arc;

use clap::Parser;
use csap_server::session::{self, Server, SocketSink};
use csap_server::Config;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = csap_server::config::Args::parse();
    let config = Config::resolve(args).unwrap_or_else(|err| {
        eprintln!("fatal: {err}");
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = Server::init(config.root.clone(), config.max_users, config.max_transfers)
        .await
        .expect("failed to initialize server root");

    let addr = format!("{}:{}", config.ip, config.port);
    let listener = TcpListener::bind(&addr).await.expect("failed to bind listen address");
    tracing::info!(root = %config.root.display(), %addr, "server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        continue;
                    }
                };
                let server = server.clone();
                tokio::spawn(async move {
                    tracing::info!(%peer, "connection accepted");
                    if let Err(err) = handle_connection(server, socket).await {
                        tracing::warn!(%peer, %err, "connection ended with error");
                    }
                    tracing::info!(%peer, "connection closed");
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested, stopping accept loop");
                break;
            }
        }
    }
}

async fn handle_connection(server: Arc<Server>, socket: tokio::net::TcpStream) -> csap_server::CsapResult<()> {
    let (read_half, write_half) = socket.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);
    let sink = Arc::new(SocketSink::new(write_half));
    session::run(&server, &mut reader, sink).await
}
