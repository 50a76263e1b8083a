//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGINT (Ctrl-C) or SIGTERM
//! - Hand control back to the caller, which runs the ordered stop
//!
//! # Design Decisions
//! - Uses Tokio's signal handling on a private current-thread runtime so
//!   the synchronous binary does not need an async main

use tokio::runtime::Builder;

/// Block the calling thread until a termination signal arrives.
pub fn wait_for_signal() -> std::io::Result<()> {
    let runtime = Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate())?;
            tokio::select! {
                res = tokio::signal::ctrl_c() => res?,
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        tracing::info!("Termination signal received");
        Ok::<(), std::io::Error>(())
    })
}
