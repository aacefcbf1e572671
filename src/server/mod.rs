pub mod database;
pub mod handler;
pub mod input_filter;
pub mod sqlite;
pub mod textfile;

use crate::util::spawn_and_log_error;
use handler::ClientHandler;
use smol::io::AsyncReadExt;
use smol::net::{TcpListener, TcpStream};
use smol::stream::StreamExt;

/// Accept OMSP clients and spawn one connection task each.
pub async fn accept_loop(addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("OML server is listening to {}", addr);

    let mut incoming = listener.incoming();
    while let Some(stream) = incoming.next().await {
        let stream = stream?;
        log::info!("new connection: {}", stream.peer_addr()?);
        spawn_and_log_error(connection_loop(stream));
    }
    Ok(())
}

async fn connection_loop(mut stream: TcpStream) -> anyhow::Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let mut handler = ClientHandler::new(&peer);
    let mut chunk = vec![0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            handler.disconnected();
            return Ok(());
        }
        if let Err(e) = handler.feed(&chunk[..n]) {
            log::warn!("[{}] {}", peer, e);
            return Ok(());
        }
    }
}
