use clap::Parser;
use order_reconciler::env::{Env, setup_tracing};
use order_reconciler::launch;
use order_reconciler::telemetry::setup_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv_override().ok();
    let env = Env::try_parse()?;
    env.validate()?;

    let _telemetry_guard = match env.hyperdx_api_key.clone() {
        Some(api_key) => Some(setup_telemetry(api_key, (&env.log_level).into())?),
        None => {
            setup_tracing(&env.log_level);
            tracing::warn!("No HYPERDX_API_KEY configured, running with console logging only");
            None
        }
    };

    launch(env).await
}
