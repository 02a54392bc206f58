//! Tablelink diagnostics runner.
//!
//! Composition root for the network core: builds the config, wires the
//! request pipeline, realtime channel, dispatcher, and connection monitor
//! together, and logs everything the table UI would consume.

use std::sync::Arc;

use anyhow::Result;
use dotenv::dotenv;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tablelink::config::NetworkConfig;
use tablelink::events::{EventBus, NetworkEvent};
use tablelink::monitor::ConnectionMonitor;
use tablelink::realtime::{topics, MessageDispatcher, RealtimeChannel, WsTransport};
use tablelink::ApiClient;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tablelink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!("🎰 Tablelink network core starting");

    let config = NetworkConfig::from_env();
    let bus = EventBus::new(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Request pipeline, with callbacks the table UI would hook
    let api = Arc::new(ApiClient::new(config.api.clone())?);
    api.set_auth_failure_callback(Box::new(|err| {
        warn!("session auth rejected, re-login required: {}", err);
    }));
    api.set_error_callback(Box::new(|err| {
        warn!("request pipeline error: {}", err);
    }));

    // Realtime channel over WebSocket
    let transport = Arc::new(WsTransport::new(config.api.auth_token.clone()));
    let channel = RealtimeChannel::new(config.channel.clone(), transport, bus.clone());

    // Dispatcher with the table message handlers
    let dispatcher = Arc::new(MessageDispatcher::new());
    dispatcher.register_handler(topics::COUNTDOWN, |envelope| {
        let remaining = envelope
            .payload
            .get("countdown_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        info!("⏱  bets close in {}ms", remaining);
        Ok(())
    });
    dispatcher.register_handler(topics::DEAL_RESULT, |envelope| {
        info!("🃏 deal result: {}", envelope.payload);
        Ok(())
    });
    dispatcher.register_handler(topics::BALANCE_UPDATE, |envelope| {
        let balance = envelope
            .payload
            .get("balance")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        info!("💰 balance: {:.2}", balance);
        Ok(())
    });
    dispatcher.register_handler(topics::GAME_ERROR, |envelope| {
        warn!("server reported game error: {}", envelope.payload);
        Ok(())
    });

    let inbound = channel
        .take_inbound()
        .expect("inbound stream already taken");
    tokio::spawn(dispatcher.clone().run(inbound, shutdown_rx.clone()));

    // Connection monitor observes the channel and probes the API
    let monitor = ConnectionMonitor::new(config.monitor.clone(), bus.clone(), channel.state_watch())?;
    tokio::spawn(monitor.clone().run(shutdown_rx.clone()));

    // Event log for everything a diagnostics UI would render
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NetworkEvent::StateChanged { from, to, reason } => match reason {
                    Some(reason) => info!("state {} -> {} ({})", from, to, reason),
                    None => info!("state {} -> {}", from, to),
                },
                NetworkEvent::QualityChanged { from, to } => {
                    info!("quality {} -> {}", from, to)
                }
                NetworkEvent::AlertRaised(alert) => {
                    warn!("[{:?}] {}: {}", alert.severity, alert.title, alert.message)
                }
                NetworkEvent::AlertCleared(id) => info!("alert cleared: {}", id),
                NetworkEvent::Liveness { silent_for } => {
                    warn!("feed silent for {:?}", silent_for)
                }
                _ => {}
            }
        }
    });

    if let Err(e) = channel.connect().await {
        warn!("initial connect failed ({}), reconnecting in background", e);
        let channel = channel.clone();
        tokio::spawn(async move {
            let _ = channel.reconnect().await;
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    channel.shutdown();

    let report = monitor.generate_report();
    info!(
        "final report: quality={} alerts={} rounds={}",
        report.quality,
        report.active_alerts.len(),
        report.rounds
    );

    Ok(())
}
