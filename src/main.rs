//! Application entry point: opens the datastore, seeds the default
//! staff accounts on first start, and serves the web backend.

mod audit;
mod authorization;
mod backend;
mod consts;
mod db;
mod models;
mod services;
mod utils;

use std::net::SocketAddr;
use std::path::PathBuf;

use dotenv::dotenv;
use log::info;

use crate::backend::AppState;
use crate::consts::{DB_PATH, HTTP_PORT};
use crate::db::Database;
use crate::services::Service;

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let db_path = std::env::var("CLINIC_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DB_PATH));
    let database = Database::open(db_path).expect("Failed to open the datastore");

    let service = Service::new(database);

    // First start only: the accounts to log in with have to come from
    // somewhere. The password must be changed right after.
    let bootstrap_password =
        std::env::var("CLINIC_BOOTSTRAP_PASSWORD").unwrap_or_else(|_| "admin123".to_string());
    service
        .seed_default_accounts(&bootstrap_password)
        .expect("Failed to seed the default accounts");

    let app = backend::router::get_router(AppState::new(service));

    let addr = SocketAddr::from(([0, 0, 0, 0], HTTP_PORT));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to open web server listener");

    // Connect info is what the audit trail falls back to when no proxy
    // header names the client.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to bind Axum to listener");
}
