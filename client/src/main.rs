use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use unison_client::{ClientConfig, LocalClock, NullPipeline, SyncClient};
use unison_proto::ReferenceClock;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "unison_client=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let server_address = env::var("UNISON_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1".into());
    let server_port: u16 = env::var("UNISON_SERVER_PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(3695);
    let id = env::var("UNISON_CLIENT_ID").unwrap_or_else(|_| {
        let generated = format!("client-{}", std::process::id());
        tracing::warn!(%generated, "UNISON_CLIENT_ID not set, using a generated id");
        generated
    });

    let config = ClientConfig {
        server_address,
        server_port,
        id,
        config: HashMap::new(),
    };

    // Without a media library wired in, playback is a no-op pipeline and
    // the clock runs free instead of being disciplined to the server.
    tracing::warn!("running with the null pipeline; no media will be rendered");
    let pipeline = Arc::new(NullPipeline::new());
    let client = SyncClient::new(
        config,
        pipeline,
        Box::new(|_addr, _port| Arc::new(LocalClock::new()) as Arc<dyn ReferenceClock>),
    );

    client.start().await?;
    tracing::info!("joined; waiting for records (ctrl-c to quit)");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    client.stop().await;
    Ok(())
}
