use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use attache::{api, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("attache=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        workspace = %config.workspace_dir.display(),
        engine = %config.engine_command,
        "starting attache"
    );

    api::serve(config).await
}
