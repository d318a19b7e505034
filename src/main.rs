//! setu-mqtt - miIO LAN-to-MQTT bridge daemon

use log::{debug, error, info};
use setu_mqtt::app::App;
use setu_mqtt::Config;
use std::env;
use std::process;

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("setu-mqtt v{} starting...", env!("CARGO_PKG_VERSION"));

    // Get config path from args or default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "./config.yml".to_string());

    info!("using config: {}", config_path);
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration: {}", err);
            process::exit(1);
        }
    };

    let app = match App::new(config) {
        Ok(app) => app,
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };
    if let Err(err) = app.run() {
        error!("{}", err);
        process::exit(1);
    }
    debug!("setu-mqtt finished");
}
