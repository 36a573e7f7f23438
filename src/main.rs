use std::net::SocketAddr;

use corelay::chat;
use tracing::info;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let server = chat::listen(SocketAddr::from(([0, 0, 0, 0], chat::PORT)))?;
    info!("relay on {}", server.local_addr()?);
    server.run()
}
