use anyhow::Result;
use clap::Parser;
use log::info;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use vpsrent_api::api::{main_router, RouterState};
use vpsrent_api::auth::AuthService;
use vpsrent_api::host::HostRegistry;
use vpsrent_api::lifecycle::VpsService;
use vpsrent_api::orders::OrderService;
use vpsrent_api::payments::PaymentService;
use vpsrent_api::provisioner::Provisioner;
use vpsrent_api::settings::Settings;
use vpsrent_api::worker::Worker;
use vpsrent_db::{VpsRentDb, VpsRentDbMysql};

#[derive(Parser)]
#[clap(about = "VPS rental control plane")]
struct Args {
    /// Path to the YAML config file
    #[clap(long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let settings = Settings::load(&args.config)?;

    let mysql = VpsRentDbMysql::new(&settings.db).await?;
    mysql.migrate().await?;
    let db: Arc<dyn VpsRentDb> = Arc::new(mysql);

    let hosts = Arc::new(HostRegistry::new());
    let auth = Arc::new(AuthService::new(db.clone(), settings.auth.clone()));
    let orders = Arc::new(OrderService::new(db.clone()));
    let payments = Arc::new(PaymentService::new(db.clone(), &settings)?);
    let provisioner = Arc::new(Provisioner::new(
        db.clone(),
        hosts.clone(),
        settings.hypervisor.clone(),
    ));
    let vps = Arc::new(VpsService::new(
        db.clone(),
        hosts.clone(),
        settings.hypervisor.clone(),
    ));

    let worker = Worker::new(db.clone(), hosts.clone(), &settings);
    let work_tx = worker.sender();
    worker.spawn_sweep_loop();
    tokio::spawn(worker.run());

    let state = RouterState {
        db,
        settings: settings.clone(),
        auth,
        orders,
        payments,
        provisioner,
        vps,
        hosts,
        work_tx,
    };

    let app = main_router()
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listen = settings
        .listen
        .unwrap_or_else(|| "0.0.0.0:8000".to_string());
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("Listening on {}", listen);
    axum::serve(listener, app).await?;
    Ok(())
}
