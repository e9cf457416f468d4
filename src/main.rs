mod capture;
mod config;
mod error;
mod frame;
mod meter;
mod protocol;
mod serial;
mod store;

use anyhow::{bail, Result};
use clap::Parser;
use log::{error, info};
use std::io::BufReader;
use std::time::Duration;

use crate::capture::Capture;
use crate::serial::Lines;
use crate::store::{JsonLinesStore, MqttStore, Stores};

fn main() -> Result<()> {
    env_logger::init();

    let config = config::Config::parse();
    info!("Starting ravenmon");

    let mut stores = Stores::new();
    if let Some(path) = &config.data_file {
        stores.push(Box::new(JsonLinesStore::open(path)?));
    }
    if !config.no_mqtt {
        info!(
            "Publishing to {} on {}:{}",
            config.mqtt_topic, config.mqtt_host, config.mqtt_port
        );
        stores.push(Box::new(MqttStore::new(
            &config.mqtt_host,
            config.mqtt_port,
            &config.mqtt_client_id,
            &config.mqtt_topic,
        )));
    }
    if stores.is_empty() {
        bail!("No storage configured: pass --data-file or enable MQTT");
    }

    let path = match &config.port {
        Some(path) => {
            info!("Using specified port: {}", path);
            path.clone()
        }
        None => {
            info!("No port specified, probing for RAVEn ...");
            serial::find_raven_port()?
        }
    };
    info!("Opening RAVEn on {} at {} baud", path, config.baud);
    let mut port = serial::open_port(&path, config.baud, Duration::from_secs(config.timeout_secs))?;

    if config.request_summation {
        info!("Requesting current summation");
        serial::request_summation(&mut *port)?;
    }

    let mut source = Lines::new(BufReader::new(port));
    let mut capture = Capture::new(stores);
    if let Err(e) = capture.run(&mut source) {
        error!("Capture stopped: {}", e);
        if let Some(kwh) = capture.meter().approximate_kwh() {
            info!("Last approximate meter reading: {}kWh", kwh);
        }
        return Err(e.into());
    }
    Ok(())
}
