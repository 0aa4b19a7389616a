//utils for graceful shutdown shared by the server and its background tasks
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let tc = token.clone();
    //spawn once to listen for ctrl-c
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(e) => error!(error = %e, "failed to install ctrl+C handler"),
        }
        tc.cancel();
    });
    token
}
