// autotake - unattended audio/MIDI recorder
// Main library entry point

pub mod config;
pub mod devices;
pub mod recording;
pub mod session;

use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use config::Config;
use devices::{health_check_loop, SystemHost, Watchdog};
use recording::{TakeMonitor, TakeWriterThread};

/// Run the recorder until SIGINT/SIGTERM.
///
/// On shutdown the streams are closed, the open take is finalized and the
/// writer thread drains before this returns.
pub fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    std::fs::create_dir_all(&config.storage_path)?;
    log::info!("Writing takes to {}", config.storage_path.display());
    log::info!("Device patterns: {:?}", config.device_patterns);

    if config.recover_on_start {
        session::recover_unfinished_takes(&config.storage_path);
    }

    let writer = TakeWriterThread::spawn(config.writer_queue_blocks, config.flush_interval())?;
    let opener = writer.opener(config.storage_path.clone())?;
    let monitor = Arc::new(Mutex::new(TakeMonitor::new(config.take_settings(), Box::new(opener))));

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    spawn_signal_listener(shutdown_tx.clone())?;

    {
        let mut watchdog = Watchdog::new(
            SystemHost::new(),
            config.device_patterns.clone(),
            config.chunk_frames,
            monitor.clone(),
        );
        health_check_loop(&mut watchdog, config.watchdog_interval(), &shutdown_rx);
    }

    // The monitor holds the last opener; dropping it lets the writer exit
    let stats = monitor.lock().stats();
    drop(monitor);
    drop(shutdown_tx);
    writer.join();

    log::info!(
        "Recorded {} take(s), {} blocks, {} MIDI messages ({} dropped)",
        stats.takes_finished,
        stats.blocks_written,
        stats.midi_placed,
        stats.midi_dropped
    );
    Ok(())
}

/// Forward SIGINT/SIGTERM to `shutdown` from a dedicated thread
fn spawn_signal_listener(shutdown: Sender<()>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("autotake-signals".into())
        .spawn(move || {
            runtime.block_on(async {
                if let Err(e) = wait_for_termination().await {
                    log::error!("Signal handler failed: {}", e);
                    return;
                }
                log::info!("Shutdown requested, finishing current take");
                let _ = shutdown.try_send(());
            });
        })?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
