//! Graceful shutdown wiring.
//!
//! First Ctrl+C flips the shared shutdown watch so every loop winds down
//! and deletes its coordinator keys; a second Ctrl+C exits immediately.

use tokio::sync::watch;

pub fn spawn_ctrl_c_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl+C, shutting down gracefully...");
            eprintln!("Press Ctrl+C again to force quit");
            let _ = tx.send(true);

            tokio::spawn(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nForce quit requested, exiting immediately...");
                    std::process::exit(1);
                }
            });

            // Keep the sender alive so receivers can still read the flag
            // while their cleanup runs.
            std::future::pending::<()>().await;
        }
    });

    rx
}
