pub mod alert;
pub mod backend;
pub mod config;
pub mod control;
pub mod mqtt;
pub mod session;
pub mod telemetry;
pub mod ui;
pub mod upload;

use crate::alert::AlertSender;
use crate::backend::http::HttpExplorationApi;
use crate::config::AppConfig;
use crate::session::SessionController;
use crate::ui::StreamControllerUI;
use color_eyre::{eyre::eyre, Result};
use eframe::egui;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const ALERT_CAPACITY: usize = 100;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = AppConfig::load()?;
    info!(
        "Broker {}, backend {}, upload every {:?}",
        config.broker, config.backend.base_url, config.upload_interval
    );

    let api = Arc::new(HttpExplorationApi::new(config.backend.base_url.clone())?);
    let (alerts, alert_receiver) = AlertSender::channel(ALERT_CAPACITY);

    let controller = SessionController::mount(config, api, alerts);

    info!("Starting UI");
    let mut native_options = eframe::NativeOptions::default();
    native_options.viewport = egui::ViewportBuilder::default()
        .with_title("Stream Controller")
        .with_inner_size([1040.0, 760.0]);

    eframe::run_native(
        "StreamController",
        native_options,
        Box::new(|cc| {
            Ok(Box::new(StreamControllerUI::new(
                cc,
                controller,
                alert_receiver,
            )))
        }),
    )
    .map_err(|e| eyre!("UI terminated with error: {}", e))?;

    info!("UI closed, shutting down");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
