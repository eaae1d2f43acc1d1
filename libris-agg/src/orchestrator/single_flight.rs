//! Single-flight de-duplication of concurrent lookups
//!
//! The first caller for a key becomes the leader: its work runs on a spawned
//! task so that dropping any caller (leader included) never cancels it.
//! Later callers for the same key subscribe to the leader's result.

use crate::types::AggregationError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

type FlightMap<T> = HashMap<String, (u64, watch::Receiver<Option<T>>)>;

/// Removes the flight entry when the leader task ends, normally or not
struct FlightGuard<T> {
    flights: Arc<Mutex<FlightMap<T>>>,
    key: String,
    generation: u64,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
        if flights.get(&self.key).map(|(g, _)| *g) == Some(self.generation) {
            flights.remove(&self.key);
        }
    }
}

pub struct SingleFlight<T> {
    flights: Arc<Mutex<FlightMap<T>>>,
    next_generation: Mutex<u64>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlightMap<T>> {
        self.flights.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `work` unless a flight for `key` is already running, then wait
    ///
    /// Returns `FlightAbandoned` if the leader task ended without a result.
    pub async fn run<F>(&self, key: &str, work: F) -> Result<T, AggregationError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut rx = {
            let mut flights = self.lock();
            match flights.get(key) {
                Some((_, rx)) => {
                    tracing::debug!(key = %key, "Joining in-flight lookup");
                    rx.clone()
                }
                None => {
                    let generation = {
                        let mut next = self.next_generation.lock().unwrap_or_else(|p| p.into_inner());
                        *next += 1;
                        *next
                    };
                    let (tx, rx) = watch::channel(None);
                    flights.insert(key.to_string(), (generation, rx.clone()));

                    let guard = FlightGuard {
                        flights: Arc::clone(&self.flights),
                        key: key.to_string(),
                        generation,
                    };
                    tokio::spawn(async move {
                        let value = work.await;
                        let _ = tx.send(Some(value));
                        drop(guard);
                    });
                    rx
                }
            }
        };

        let value = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| AggregationError::FlightAbandoned)?
            .clone();
        value.ok_or(AggregationError::FlightAbandoned)
    }

    /// Number of keys with a running leader
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    /// Forget every running flight; running leaders finish but are no
    /// longer joined by new callers
    pub fn reset(&self) {
        self.lock().clear();
    }
}
