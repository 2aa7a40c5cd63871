use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::monitor::ConnectionMonitor;
use crate::platform::{DeliveryChannel, MessageSource};
use crate::poller::Poller;
use crate::relay::Relay;

/// Wire the poller, monitor and relay together, run until `shutdown`
/// resolves, then stop both loops and release the collaborators.
pub async fn run<S>(
    config: &Config,
    source: Arc<dyn MessageSource>,
    delivery: Arc<dyn DeliveryChannel>,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()>,
{
    let relay = Arc::new(Relay::new(
        Arc::clone(&delivery),
        &config.delivery,
        &config.relay,
    ));
    info!(
        "Relay ready: {} whitelisted recipients, operator {}",
        relay.whitelist_len(),
        relay.operator_id()
    );

    let mut poller = Poller::new(
        Arc::clone(&source),
        Arc::clone(&relay),
        &config.source,
        &config.poller,
    );

    let channel_name = poller.channel_name().await;
    info!(
        "Starting poller for channel {} (id {})",
        channel_name, config.source.channel_id
    );

    if let Err(e) = poller
        .initialize()
        .await
        .context("Failed to initialize the poller")
    {
        release(delivery.as_ref(), source.as_ref()).await;
        return Err(e);
    }

    let monitor = ConnectionMonitor::new(
        Arc::clone(&source),
        Duration::from_secs(config.poller.monitor_interval_secs),
    );

    let cancel = CancellationToken::new();
    let mut poll_handle = tokio::spawn(poller.run(cancel.clone()));
    let mut monitor_handle = tokio::spawn(monitor.run(cancel.clone()));
    info!("Poller active");

    let mut poll_done = false;
    let mut monitor_done = false;
    tokio::select! {
        () = shutdown => {}
        result = &mut poll_handle => {
            poll_done = true;
            warn!("Poller exited unexpectedly");
            log_join("poller", result);
        }
        result = &mut monitor_handle => {
            monitor_done = true;
            warn!("Connection monitor exited unexpectedly");
            log_join("monitor", result);
        }
    }

    cancel.cancel();
    if !poll_done {
        log_join("poller", poll_handle.await);
    }
    if !monitor_done {
        log_join("monitor", monitor_handle.await);
    }

    release(delivery.as_ref(), source.as_ref()).await;
    info!("Relay stopped");
    Ok(())
}

fn log_join(name: &str, result: Result<(), JoinError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => info!("{} task cancelled", name),
        Err(e) => error!("{} task failed: {}", name, e),
    }
}

async fn release(delivery: &dyn DeliveryChannel, source: &dyn MessageSource) {
    delivery.close().await;
    source.disconnect().await;
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl-C, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl-C, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeliveryConfig, PollerConfig, RelayConfig, SourceConfig};
    use crate::poller::tests::{msg, ScriptedSource};
    use crate::relay::tests::{RecordingChannel, OPERATOR};
    use std::sync::atomic::Ordering;

    fn config() -> Config {
        Config {
            source: SourceConfig {
                credentials: "c".into(),
                channel_id: -1001,
            },
            delivery: DeliveryConfig {
                token: "t".into(),
                whitelist_ids: vec![1, 2, 3],
                operator_id: OPERATOR,
            },
            poller: PollerConfig {
                poll_interval_ms: 5,
                poll_limit: 10,
                monitor_interval_secs: 1,
            },
            relay: RelayConfig { max_concurrent: 10 },
        }
    }

    #[tokio::test]
    async fn test_run_relays_and_releases_on_shutdown() {
        let source = Arc::new(ScriptedSource::with_batches(vec![
            Ok(vec![msg(1, Some("old"))]),
            Ok(vec![msg(2, Some("fresh")), msg(1, Some("old"))]),
        ]));
        let channel = Arc::new(RecordingChannel::default());

        run(
            &config(),
            source.clone(),
            channel.clone(),
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await
        .unwrap();

        assert_eq!(channel.attempts_for(OPERATOR).await, vec!["fresh"]);
        assert_eq!(channel.attempts_for(3).await, vec!["fresh"]);
        assert_eq!(channel.closed.load(Ordering::SeqCst), 1);
        assert!(source.disconnected.load(Ordering::SeqCst));
        assert!(source.liveness_samples() >= 1);
    }

    #[tokio::test]
    async fn test_run_fails_when_seeding_fails() {
        let source = Arc::new(ScriptedSource::with_batches(vec![Err("unauthorized".into())]));
        let channel = Arc::new(RecordingChannel::default());

        let err = run(&config(), source.clone(), channel.clone(), std::future::pending())
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("unauthorized"));
        assert_eq!(channel.closed.load(Ordering::SeqCst), 1);
        assert!(source.disconnected.load(Ordering::SeqCst));
        assert!(channel.sent.lock().await.is_empty());
    }
}
