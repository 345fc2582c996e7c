use std::net::SocketAddr;

use clap::Parser;
use inkpost::cli::{
    Args, build_config, handle_create_admin, init_logging, load_secrets, open_database,
    open_store, system_clock,
};
use inkpost::{create_app, init_cleanup};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(&args.log_format);

    let Some(db) = open_database(&args.database).await else {
        std::process::exit(1);
    };

    if let Some(email) = args.create_admin.as_deref() {
        if let Err(e) = handle_create_admin(&db, email).await {
            error!("{}", e);
            std::process::exit(1);
        }
        return;
    }

    let Some((access_secret, refresh_secret)) = load_secrets(&args) else {
        std::process::exit(1);
    };

    match db.users().has_admin().await {
        Ok(false) => warn!("No admin account exists. Create one with --create-admin <email>"),
        Ok(true) => {}
        Err(e) => warn!(error = %e, "Failed to check for admin account"),
    }

    let clock = system_clock();
    let Some(store) = open_store(&args, &db, clock.clone()).await else {
        std::process::exit(1);
    };

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!(address = %addr, error = %e, "Failed to bind");
            std::process::exit(1);
        });

    let local_addr = listener.local_addr().unwrap_or_else(|e| {
        error!(error = %e, "Failed to get local address");
        std::process::exit(1);
    });

    let config = build_config(&args, db, store, clock, access_secret, refresh_secret);
    init_cleanup(config.store.clone()).await;
    let app = create_app(&config);

    info!(address = %local_addr, failure_policy = ?config.failure_policy, "Listening");

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    if let Err(e) = axum::serve(listener, make_service).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
