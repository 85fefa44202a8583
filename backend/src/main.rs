use std::sync::Arc;

use anyhow::Context;
use backend::{app, config::Args, service, store, AppState, Command, LogNotifier};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = store::open(&args.storage_config())
        .await
        .context("opening storage")?;

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::ImportUsers { file } => {
            let count = service::import_users(store.as_ref(), &file)
                .await
                .with_context(|| format!("importing users from {}", file.display()))?;
            info!(count, "import finished");
        }
        Command::Serve => {
            let (admin, generated) = args.bootstrap_admin();
            let seeded = service::bootstrap_users(store.as_ref(), &admin)
                .await
                .context("seeding the admin user")?;
            if seeded && generated {
                warn!(
                    email = %admin.email,
                    password = %admin.password,
                    "ADMIN_PASSWORD not set, generated a password for the seeded admin"
                );
            }
            let state = AppState::new(store, Arc::new(LogNotifier), args.settings());
            let listener = tokio::net::TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("binding {}", args.listen))?;
            info!(listen = %args.listen, storage = ?args.storage, "starting server");
            axum::serve(listener, app(state)).await.context("server error")?;
        }
    }
    Ok(())
}
