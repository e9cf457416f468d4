use chrono::{DateTime, Utc};
use log::{debug, error, info};
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use crate::error::StorageError;
use crate::meter::Estimate;

/// Append-only sink for decoded readings.
pub trait Store {
    fn save_demand(&mut self, at: DateTime<Utc>, watts: f64) -> Result<(), StorageError>;
    fn save_summation(&mut self, at: DateTime<Utc>, kwh: f64) -> Result<(), StorageError>;

    /// Interpolated meter reading after a demand. Stores that only keep
    /// device readings ignore it.
    fn save_estimate(&mut self, _at: DateTime<Utc>, _estimate: &Estimate) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Serialized form of a stored reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Demand { at: DateTime<Utc>, watts: f64 },
    Summation { at: DateTime<Utc>, kwh: f64 },
    Estimate {
        at: DateTime<Utc>,
        approx_kwh: f64,
        last_actual_kwh: f64,
        stale: bool,
    },
}

impl Record {
    fn topic_suffix(&self) -> &'static str {
        match self {
            Record::Demand { .. } => "demand",
            Record::Summation { .. } => "summation",
            Record::Estimate { .. } => "estimate",
        }
    }
}

/// Writes one JSON object per line to a file, flushing after each record.
pub struct JsonLinesStore<W: Write> {
    out: W,
}

impl JsonLinesStore<BufWriter<File>> {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Appending readings to {}", path.display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonLinesStore<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn append(&mut self, record: &Record) -> Result<(), StorageError> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> Store for JsonLinesStore<W> {
    fn save_demand(&mut self, at: DateTime<Utc>, watts: f64) -> Result<(), StorageError> {
        self.append(&Record::Demand { at, watts })
    }

    fn save_summation(&mut self, at: DateTime<Utc>, kwh: f64) -> Result<(), StorageError> {
        self.append(&Record::Summation { at, kwh })
    }
}

/// Publishes each record as JSON to `<topic>/demand`, `<topic>/summation` or
/// `<topic>/estimate` over one long-lived broker connection.
pub struct MqttStore {
    client: Client,
    connection: Connection,
    broker: String,
    topic: String,
}

impl MqttStore {
    /// Nothing is sent until the first publish drives the connection.
    pub fn new(host: &str, port: u16, client_id: &str, topic: &str) -> Self {
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(60));
        let (client, connection) = Client::new(opts, 10);

        Self {
            client,
            connection,
            broker: format!("{}:{}", host, port),
            topic: topic.trim_end_matches('/').to_string(),
        }
    }

    pub fn topic_for(&self, record: &Record) -> String {
        format!("{}/{}", self.topic, record.topic_suffix())
    }

    /// Queue at QoS 0 and drive the event loop until the publish is written,
    /// so records leave in arrival order. A connection error is returned and
    /// the next publish reconnects.
    fn publish(&mut self, record: &Record) -> Result<(), StorageError> {
        let payload = serde_json::to_string(record)?;
        let topic = self.topic_for(record);

        self.client
            .publish(&topic, QoS::AtMostOnce, false, payload.into_bytes())
            .map_err(|e| StorageError::Publish(format!("failed to queue publish: {}", e)))?;

        for event in self.connection.iter() {
            match event {
                Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                    debug!("Published to {} on {}", topic, self.broker);
                    return Ok(());
                }
                Ok(Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker {}", self.broker);
                }
                Ok(_) => continue,
                Err(e) => return Err(StorageError::Publish(e.to_string())),
            }
        }
        Err(StorageError::Publish("MQTT connection closed".to_string()))
    }
}

impl Store for MqttStore {
    fn save_demand(&mut self, at: DateTime<Utc>, watts: f64) -> Result<(), StorageError> {
        self.publish(&Record::Demand { at, watts })
    }

    fn save_summation(&mut self, at: DateTime<Utc>, kwh: f64) -> Result<(), StorageError> {
        self.publish(&Record::Summation { at, kwh })
    }

    fn save_estimate(&mut self, at: DateTime<Utc>, estimate: &Estimate) -> Result<(), StorageError> {
        self.publish(&Record::Estimate {
            at,
            approx_kwh: estimate.approx_kwh,
            last_actual_kwh: estimate.last_actual_kwh,
            stale: estimate.stale,
        })
    }
}

/// Fans each write out to every configured store. All stores are attempted;
/// the first failure is returned and later ones are logged.
#[derive(Default)]
pub struct Stores {
    stores: Vec<Box<dyn Store>>,
}

impl Stores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, store: Box<dyn Store>) {
        self.stores.push(store);
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    fn each(
        &mut self,
        mut write: impl FnMut(&mut dyn Store) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let mut first = None;
        for store in &mut self.stores {
            if let Err(e) = write(store.as_mut()) {
                if first.is_none() {
                    first = Some(e);
                } else {
                    error!("Failed to store reading: {}", e);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Store for Stores {
    fn save_demand(&mut self, at: DateTime<Utc>, watts: f64) -> Result<(), StorageError> {
        self.each(|store| store.save_demand(at, watts))
    }

    fn save_summation(&mut self, at: DateTime<Utc>, kwh: f64) -> Result<(), StorageError> {
        self.each(|store| store.save_summation(at, kwh))
    }

    fn save_estimate(&mut self, at: DateTime<Utc>, estimate: &Estimate) -> Result<(), StorageError> {
        self.each(|store| store.save_estimate(at, estimate))
    }
}
