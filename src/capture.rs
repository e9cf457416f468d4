use log::{debug, error, info, warn};

use crate::error::TransportError;
use crate::frame::{Element, FrameAssembler};
use crate::meter::{MeterState, Observation};
use crate::protocol::{decode, Reading};
use crate::serial::LineSource;
use crate::store::Store;

/// Drives line source → assembler → decoder → meter state → store.
pub struct Capture<S> {
    store: S,
    assembler: FrameAssembler,
    meter: MeterState,
}

impl<S: Store> Capture<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            assembler: FrameAssembler::new(),
            meter: MeterState::new(),
        }
    }

    pub fn meter(&self) -> &MeterState {
        &self.meter
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process lines until the source fails. Per-frame and storage errors
    /// are logged and skipped; only the transport error is returned.
    pub fn run(&mut self, source: &mut impl LineSource) -> Result<(), TransportError> {
        info!("Capture loop starting");
        loop {
            let line = match source.next_line() {
                Ok(line) => line,
                Err(e) => {
                    if self.assembler.in_element() {
                        warn!("Line source failed mid-frame; partial element discarded");
                    }
                    return Err(e);
                }
            };
            self.process_line(&line);
        }
    }

    /// Feed one raw line. Returns the observation if it completed a frame
    /// that decoded.
    pub fn process_line(&mut self, line: &[u8]) -> Option<Observation> {
        let text = String::from_utf8_lossy(line);
        debug!("Serial: {}", text.trim());

        match self.assembler.push(&text) {
            Ok(Some(element)) => self.process_element(&element),
            Ok(None) => None,
            Err(e) => {
                debug!("Dropping frame: {}", e);
                None
            }
        }
    }

    fn process_element(&mut self, element: &Element) -> Option<Observation> {
        match decode(element) {
            Ok(reading) => Some(self.record(&reading)),
            Err(e) => {
                info!("Not a {} packet: {}", element.kind.name(), e);
                None
            }
        }
    }

    fn record(&mut self, reading: &Reading) -> Observation {
        let observation = self.meter.observe(reading);
        match &observation {
            Observation::Summation { at, kwh } => {
                if let Err(e) = self.store.save_summation(*at, *kwh) {
                    error!("Failed to store summation: {}", e);
                }
            }
            Observation::Demand {
                at,
                watts,
                estimate,
            } => {
                if let Err(e) = self.store.save_demand(*at, *watts) {
                    error!("Failed to store demand: {}", e);
                }
                if let Some(estimate) = estimate {
                    if let Err(e) = self.store.save_estimate(*at, estimate) {
                        error!("Failed to store estimate: {}", e);
                    }
                }
            }
            Observation::RepeatedSummation => {}
        }
        observation
    }
}
