use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tungstenite::WebSocket;

pub(crate) type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// Open browser tabs kept connected; older connections are closed.
const MAX_CLIENTS: usize = 10;

/// Binds the live-reload socket, on port 1337 when it is free.
pub fn reserve_port() -> std::io::Result<(TcpListener, u16)> {
    let listener = match TcpListener::bind("127.0.0.1:1337") {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind("127.0.0.1:0")?,
    };

    let addr = listener.local_addr()?;
    let port = addr.port();
    Ok((listener, port))
}

pub(crate) fn new_thread_ws_incoming(server: TcpListener, clients: Clients) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("live-reload connection failed: {e}");
                    continue;
                }
            };

            match tungstenite::accept(stream) {
                Ok(socket) => clients.lock().unwrap().push(socket),
                Err(e) => tracing::warn!("live-reload handshake failed: {e}"),
            }
        }
    })
}

/// Broadcasts `"reload"` to every client for each signal received.
pub(crate) fn new_thread_ws_reload(clients: Clients) -> (Sender<()>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();

    let thread = std::thread::spawn(move || {
        while rx.recv().is_ok() {
            let mut clients = clients.lock().unwrap();
            let mut broken = vec![];

            for (i, socket) in clients.iter_mut().enumerate() {
                match socket.send("reload".into()) {
                    Ok(_) => {}
                    Err(tungstenite::error::Error::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        broken.push(i);
                    }
                    Err(tungstenite::error::Error::ConnectionClosed | tungstenite::error::Error::AlreadyClosed) => {
                        broken.push(i);
                    }
                    Err(e) => tracing::error!("couldn't send reload: {e}"),
                }
            }

            for i in broken.into_iter().rev() {
                clients.remove(i);
            }

            let len = clients.len();
            if len > MAX_CLIENTS {
                for mut socket in clients.drain(0..len - MAX_CLIENTS) {
                    socket.close(None).ok();
                }
            }

            tracing::debug!(clients = clients.len(), "sent reload");
        }
    });

    (tx, thread)
}
