use std::{net::SocketAddr, thread};

use axum::Router;
use camino::Utf8PathBuf;
use console::style;
use tower_http::services::{ServeDir, ServeFile};
use tracing::info;

/// Serves `root` on `127.0.0.1:port`, with `index` answering `/`.
pub(crate) fn start(root: Utf8PathBuf, index: Option<String>, port: u16) -> thread::JoinHandle<Result<(), anyhow::Error>> {
    let page = index.as_deref().unwrap_or_default();
    info!(url = %style(format!("http://localhost:{port}/{page}")).yellow(), "starting a HTTP server");

    thread::spawn(move || {
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(serve(root, index, port));

        if let Err(e) = &result {
            tracing::error!("HTTP server stopped: {e:#}");
        }

        result
    })
}

async fn serve(root: Utf8PathBuf, index: Option<String>, port: u16) -> Result<(), anyhow::Error> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let address = tokio::net::TcpListener::bind(address).await?;

    let mut router = Router::new();
    if let Some(index) = index {
        router = router.route_service("/", ServeFile::new(root.join(index)));
    }
    let router = router.fallback_service(ServeDir::new(root));

    axum::serve(address, router).await?;

    Ok(())
}
