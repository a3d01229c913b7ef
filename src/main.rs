use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration};

use soil_probe_session::bluetooth::{BluerRadio, RADIO_EVENT_BUFFER_SIZE};
use soil_probe_session::utils::format_datetime;
use soil_probe_session::{
    PeripheralDescriptor, SessionConfig, SessionError, SessionEvent, SessionManager, Submission,
};

const RESCAN_DELAY_SECS: u64 = 5;

/// Wait for the first connectable probe of one scan round.
async fn discover_probe(
    session: &SessionManager,
    events: &mut broadcast::Receiver<SessionEvent>,
) -> Result<Option<PeripheralDescriptor>, Box<dyn std::error::Error>> {
    session.start_scan().await?;
    loop {
        match events.recv().await {
            Ok(SessionEvent::PeripheralDiscovered(probe)) if probe.connectable => {
                return Ok(Some(probe));
            }
            Ok(SessionEvent::ScanStopped) => return Ok(None),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Missed {} session events", skipped),
            Err(RecvError::Closed) => return Ok(None),
        }
    }
}

/// Forward readings until the link goes away.
async fn stream_readings(
    session: &SessionManager,
    events: &mut broadcast::Receiver<SessionEvent>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ReadingUpdated(reading)) => {
                let Some(probe) = session.snapshot().connected_peripheral else {
                    continue;
                };
                let submission = Submission::new(reading, probe.id, None);
                info!(
                    "Reading at {} from {}:",
                    format_datetime(&submission.reading.timestamp()),
                    submission.device_id
                );
                for (channel, value) in submission.reading.values() {
                    info!("  {}: {} {}", channel, value, channel.unit());
                }
                debug!("Hand-off fields: {:?}", submission.fields());
            }
            Ok(SessionEvent::DecodeFailed { wire_id, error, .. }) => {
                debug!("Payload on {} dropped: {}", wire_id, error);
            }
            Ok(SessionEvent::ConnectionLost(probe)) => {
                warn!("Probe {} went away", probe);
                return;
            }
            Ok(SessionEvent::RadioEnabledChanged(false)) => {
                warn!("Bluetooth turned off while streaming");
                return;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Missed {} session events", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn wait_for_radio(events: &mut broadcast::Receiver<SessionEvent>) {
    info!("Waiting for Bluetooth to be switched on");
    loop {
        match events.recv().await {
            Ok(SessionEvent::RadioEnabledChanged(true)) | Err(RecvError::Closed) => return,
            _ => {}
        }
    }
}

async fn main_loop(session: SessionManager) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting soil probe session");
    let mut events = session.subscribe();

    loop {
        let probe = match discover_probe(&session, &mut events).await {
            Ok(Some(probe)) => probe,
            Ok(None) => {
                warn!("No soil probe found in this scan window");
                sleep(Duration::from_secs(RESCAN_DELAY_SECS)).await;
                continue;
            }
            Err(e) => match e.downcast_ref::<SessionError>() {
                Some(SessionError::AdapterDisabled) => {
                    wait_for_radio(&mut events).await;
                    continue;
                }
                _ => return Err(e),
            },
        };

        match session.connect(probe.clone()).await {
            Ok(channels) if channels.is_empty() => {
                warn!("{} has no soil channels, ignoring it", probe.display_name());
                session.disconnect().await?;
                sleep(Duration::from_secs(RESCAN_DELAY_SECS)).await;
                continue;
            }
            Ok(channels) => info!("Probe channels: {:?}", channels),
            Err(e) => {
                error!("Could not connect to {}: {}", probe.display_name(), e);
                sleep(Duration::from_secs(RESCAN_DELAY_SECS)).await;
                continue;
            }
        }

        match session.read_or_subscribe().await {
            Ok(live) => info!("Streaming {} channels", live.len()),
            Err(e) => {
                error!("Failed to start streaming: {}", e);
                continue;
            }
        }

        stream_readings(&session, &mut events).await;
        sleep(Duration::from_secs(RESCAN_DELAY_SECS)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match SessionConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let (radio_tx, radio_rx) = mpsc::channel(RADIO_EVENT_BUFFER_SIZE);
    let radio = BluerRadio::new(config.adapter.as_deref(), radio_tx).await?;
    let session = SessionManager::new(Arc::new(radio), config).await?;
    let pump = session.spawn(radio_rx);

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        let _ = tx.send(());
    });

    // Run main loop or wait for shutdown signal
    tokio::select! {
        result = main_loop(session.clone()) => {
            match result {
                Ok(_) => info!("Program completed successfully"),
                Err(e) => error!("Fatal error: {}", e),
            }
        }
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    match session.disconnect().await {
        Ok(()) | Err(SessionError::NotConnected) => {}
        Err(e) => warn!("Disconnect on exit failed: {}", e),
    }
    let _ = session.stop_scan().await;
    pump.abort();

    Ok(())
}
