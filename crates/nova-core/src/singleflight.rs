use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Collapses concurrent calls for the same key into one execution.
///
/// The first caller becomes the leader: its work runs on a spawned task so a
/// cancelled leader cannot strand the followers, and the key is removed
/// before the result is published so late arrivals start a fresh flight.
pub struct Singleflight<T: Clone + Send + Sync + 'static> {
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<Option<T>>>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Singleflight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` under `key`, or wait for the flight already running there.
    ///
    /// Returns the value and whether it was shared (this caller did not lead).
    /// `Err` means the leading task died without publishing a result.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<(T, bool), FlightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (mut rx, leader) = {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(rx) = inflight.get(key) {
                (rx.clone(), false)
            } else {
                let (tx, rx) = watch::channel(None::<T>);
                inflight.insert(key.to_string(), rx.clone());
                let fut = work();
                let inflight_map = Arc::clone(&self.inflight);
                let key_owned = key.to_string();
                tokio::spawn(async move {
                    let guard = FlightGuard {
                        inflight: inflight_map,
                        key: key_owned,
                    };
                    let value = fut.await;
                    drop(guard);
                    let _ = tx.send(Some(value));
                });
                (rx, true)
            }
        };

        let result = match rx.wait_for(|v| v.is_some()).await {
            Ok(value) => Ok((value.clone().unwrap(), !leader)),
            Err(_) => Err(FlightError::Aborted),
        };
        result
    }

    #[cfg(test)]
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }
}

/// Removes the key when the flight ends, normally or by panic, so the next
/// caller is never stuck behind a dead flight.
struct FlightGuard<T: Clone + Send + Sync + 'static> {
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<Option<T>>>>>,
    key: String,
}

impl<T: Clone + Send + Sync + 'static> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.inflight.lock().unwrap().remove(&self.key);
    }
}

#[derive(Debug)]
pub enum FlightError {
    /// The leading task was aborted or panicked before publishing.
    Aborted,
}

impl std::fmt::Display for FlightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlightError::Aborted => write!(f, "singleflight leader aborted without a result"),
        }
    }
}

impl std::error::Error for FlightError {}

/// Keyed in-progress marker for fire-and-forget work that should not pile up,
/// like background snapshot creation per function.
#[derive(Default)]
pub struct InflightSet {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl InflightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. Returns `None` while a previous claim is still held.
    pub fn begin(&self, key: &str) -> Option<InflightGuard> {
        let mut keys = self.keys.lock().unwrap();
        if !keys.insert(key.to_string()) {
            return None;
        }
        Some(InflightGuard {
            keys: Arc::clone(&self.keys),
            key: key.to_string(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().unwrap().contains(key)
    }
}

pub struct InflightGuard {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.keys.lock().unwrap().remove(&self.key);
    }
}
