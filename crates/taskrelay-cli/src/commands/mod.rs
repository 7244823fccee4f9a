pub mod broker;
pub mod forwarder;
pub mod register;
pub mod status;
pub mod submit;
pub mod worker;

use tokio_util::sync::CancellationToken;

/// Token cancelled on Ctrl-C.
pub fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, shutting down");
                cancel.cancel();
            },
            Err(e) => tracing::warn!(error = %e, "could not listen for interrupts"),
        }
    });
    token
}
