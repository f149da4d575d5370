pub mod config;
pub mod discord;
pub mod logging;
pub mod permissions;
pub mod sentinel;

use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::error;

use config::Settings;
use sentinel::Sentinel;

/// Process-wide context: settings plus the sentinel service, injected
/// after construction so the service can hold the context back.
pub struct AppContext {
    pub settings: Settings,
    sentinel: OnceCell<Arc<Sentinel>>,
}

impl AppContext {
    /// Full startup: logging, service, background sweeper, health server.
    /// Must run inside a tokio runtime.
    pub fn bootstrap(settings: Settings) -> Arc<Self> {
        logging::init(&settings);
        let ctx = Arc::new(Self {
            settings,
            sentinel: OnceCell::new(),
        });

        let service = Sentinel::new(Arc::clone(&ctx));
        service.spawn_sweeper();
        let _ = ctx.sentinel.set(service);

        if let Some(addr) = ctx
            .settings
            .discord
            .health_addr
            .clone()
            .filter(|a| !a.is_empty())
        {
            tokio::spawn(async move {
                if let Err(e) = sentinel::api::serve(addr).await {
                    error!(error = %e, "health endpoint failed");
                }
            });
        }

        ctx
    }

    /// Context without logging, sweeper or health server, for tests.
    pub fn new_testing(settings: Settings) -> Arc<Self> {
        let ctx = Arc::new(Self {
            settings,
            sentinel: OnceCell::new(),
        });
        let service = Sentinel::new(Arc::clone(&ctx));
        let _ = ctx.sentinel.set(service);
        ctx
    }

    /// Always set by both constructors.
    pub fn sentinel(&self) -> Arc<Sentinel> {
        Arc::clone(self.sentinel.get().expect("sentinel service initialized"))
    }

    pub fn env(&self) -> &str {
        &self.settings.env
    }
}

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    discord::run_bot(ctx).await
}
