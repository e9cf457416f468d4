use clap::Parser;
use std::path::PathBuf;

use crate::serial::DEFAULT_BAUD_RATE;

#[derive(Parser, Debug)]
#[command(
    name = "ravenmon",
    about = "Rainforest RAVEn smart meter capture via USB serial"
)]
pub struct Config {
    /// Serial port path (if omitted, probes for the RAVEn's USB id)
    #[arg(long)]
    pub port: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    pub baud: u32,

    /// Serial read timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,

    /// Ask the meter for a summation at startup
    #[arg(long)]
    pub request_summation: bool,

    /// Append readings as JSON lines to this file
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    /// Do not publish readings over MQTT
    #[arg(long)]
    pub no_mqtt: bool,

    /// MQTT broker hostname
    #[arg(long, default_value = "127.0.0.1")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT client ID
    #[arg(long, default_value = "RAVEN-CAPTURE")]
    pub mqtt_client_id: String,

    /// MQTT topic prefix; readings go to <topic>/demand and <topic>/summation
    #[arg(long, default_value = "tele/raven")]
    pub mqtt_topic: String,
}
