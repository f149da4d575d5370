use anyhow::Result;
use bright_sentinel::{AppContext, config::Settings};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    let app = AppContext::bootstrap(settings);
    info!(env = app.env(), "starting {}", app.settings.app.name);
    bright_sentinel::run(app).await
}
