use anyhow::Context;
use sip_ai_bridge::application::{RuntimeOptions, RuntimeState};
use sip_ai_bridge::config::{AgentWatcher, Settings};
use sip_ai_bridge::infrastructure::protocols::sip::{
    AckHandler, HangupHandler, InviteHandler, OptionsHandler, SipMethod, SipServer,
    SipServerConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting sip-ai-bridge {}", env!("CARGO_PKG_VERSION"));
    info!("Settings: {:?}", Settings { sip_pass: "***".to_string(), ..settings.clone() });

    let listen_addr: SocketAddr = settings
        .sip_listen_addr
        .parse()
        .with_context(|| format!("invalid SIP_LISTEN_ADDR {:?}", settings.sip_listen_addr))?;

    let mut server = SipServer::new(SipServerConfig::new(listen_addr));
    let bound = server
        .start()
        .await
        .with_context(|| format!("binding SIP listener on {}", listen_addr))?;

    let runtime = Arc::new(RuntimeState::new(
        bound.port(),
        RuntimeOptions::from_settings(&settings),
    ));
    server
        .register_handler(SipMethod::Invite, Arc::new(InviteHandler::new(runtime.clone())))
        .await;
    server.register_handler(SipMethod::Ack, Arc::new(AckHandler)).await;
    server
        .register_handler(SipMethod::Bye, Arc::new(HangupHandler::bye(runtime.clone())))
        .await;
    server
        .register_handler(SipMethod::Cancel, Arc::new(HangupHandler::cancel(runtime.clone())))
        .await;
    server
        .register_handler(SipMethod::Options, Arc::new(OptionsHandler))
        .await;
    info!("SIP listener ready on {}", bound);

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(AgentWatcher::new(settings, runtime.clone()).run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutting down");

    cancel.cancel();
    if let Err(e) = watcher.await {
        warn!("Agent watcher ended abnormally: {}", e);
    }
    runtime.shutdown().await;
    server.stop().await?;

    info!("sip-ai-bridge stopped");
    Ok(())
}
