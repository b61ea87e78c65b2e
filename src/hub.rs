//! The polling hub: drives the read side of the protocol on a fixed interval
//! and serializes clamped writes on demand.
//!
//! One `Hub` per configured connection; it owns its transport, its snapshot
//! and its listener set, and is handed explicitly to whatever consumes the
//! decoded state. The snapshot is replaced wholesale after each successful
//! cycle, so readers always see a complete cycle and never need a lock beyond
//! the `Arc` clone.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tokio_modbus::client::{tcp::attach_slave, Context, Reader, Writer};
use tokio_modbus::slave::SlaveContext;
use tokio_modbus::Slave;
use tracing::{debug, info, warn};

use crate::codec::{self, Address, DataType, Quantity, Value, Word};
use crate::config::HubConfig;
use crate::error::{Error, Result};
use crate::map::{self, Bounds, FieldGroup};

/// The atomically-published decoded state of the most recent poll cycle.
pub type Snapshot = Arc<HashMap<String, Value>>;

type Listener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

struct HubShared {
    config: HubConfig,
    /// One transport per hub; `None` after a transport failure until the
    /// next cycle reconnects.
    client: AsyncMutex<Option<Context>>,
    snapshot: RwLock<Snapshot>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    /// At most one in-flight write per socket; later writes wait here.
    write_gates: HashMap<u8, AsyncMutex<()>>,
}

/// Polling coordinator for one station connection.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
}

/// Scoped listener registration; dropping it deregisters the listener.
pub struct Subscription {
    shared: Weak<HubShared>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .listeners
                .lock()
                .unwrap()
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl Hub {
    /// Connect to the station. An unreachable host here is a fatal setup
    /// failure; transport failures after this point are retried per cycle.
    pub async fn connect(config: HubConfig) -> Result<Self> {
        config.validate()?;
        let write_gates = config
            .socket_units()
            .into_iter()
            .map(|unit| (unit, AsyncMutex::new(())))
            .collect();
        let shared = Arc::new(HubShared {
            config,
            client: AsyncMutex::new(None),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            write_gates,
        });
        let hub = Hub { shared };

        let context = hub.connect_transport().await?;
        *hub.shared.client.lock().await = Some(context);
        info!(
            host = %hub.shared.config.host,
            port = hub.shared.config.port,
            "connected to station"
        );
        Ok(hub)
    }

    /// The last published snapshot; empty until the first successful cycle.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshot.read().unwrap().clone()
    }

    /// Convenience lookup of a single decoded field.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.snapshot().get(key).cloned()
    }

    /// Register a listener invoked with every newly published snapshot.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener)));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Poll every configured device once and publish the merged snapshot.
    ///
    /// Field groups are read in declared order. A failed group leaves its
    /// previous fields untouched and is retried next cycle; the staged map is
    /// published atomically after the sweep. Returns an error only when every
    /// group failed (the previous snapshot then stands unpublished).
    pub async fn poll_once(&self) -> Result<()> {
        let mut staged: HashMap<String, Value> = (*self.snapshot()).clone();
        let mut succeeded = 0usize;
        let mut last_error = None;

        let station = self.shared.config.station_unit;
        for group in map::STATION_GROUPS {
            match self.read_group(station, group, None, &mut staged).await {
                Ok(()) => succeeded += 1,
                Err(err) => {
                    warn!(unit = station, group = group.name, %err, "poll group failed");
                    last_error = Some(err);
                }
            }
        }
        for socket in self.shared.config.socket_units() {
            for group in map::SOCKET_GROUPS {
                match self.read_group(socket, group, Some(socket), &mut staged).await {
                    Ok(()) => succeeded += 1,
                    Err(err) => {
                        warn!(unit = socket, group = group.name, %err, "poll group failed");
                        last_error = Some(err);
                    }
                }
            }
        }

        if succeeded == 0 {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        self.publish(staged);
        Ok(())
    }

    /// Poll forever on the configured interval. Cycle failures are logged
    /// and retried; nothing short of task cancellation stops the loop.
    pub async fn run(&self) {
        let mut tick = tokio::time::interval(self.shared.config.scan_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if let Err(err) = self.poll_once().await {
                warn!(%err, "poll cycle failed");
            }
        }
    }

    /// Set the commanded max current of one socket.
    ///
    /// The value is clamped to the most recently observed hard ceiling
    /// (station `actualMaxCurrent`, else the socket's safe current), falling
    /// back to the field's static maximum; values outside the absolute
    /// bounds even after clamping are rejected before transmission. Returns
    /// the value actually transmitted.
    pub async fn set_max_current(&self, socket: u8, amps: f32) -> Result<f32> {
        let gate = self
            .shared
            .write_gates
            .get(&socket)
            .ok_or(Error::UnknownDevice(socket))?;

        let bounds = map::SLAVE_MAX_CURRENT_BOUNDS;
        let value = clamped_value(amps, self.hard_limit(socket), bounds)?;
        if value < amps {
            warn!(
                socket,
                requested = amps,
                transmitted = value,
                "commanded max current exceeds hard limit, clamping"
            );
        }

        let words = codec::encode(DataType::F32, &Value::F32(value))?;
        let _in_flight = gate.lock().await;
        self.write_registers(socket, map::SLAVE_MAX_CURRENT_ADDR, &words)
            .await?;
        debug!(socket, value, "commanded max current written");
        Ok(value)
    }

    /// Two-tier observed hard limit: the station-wide ceiling if present,
    /// else the socket's load-balancing safe current.
    fn hard_limit(&self, socket: u8) -> Option<f32> {
        let snapshot = self.snapshot();
        snapshot
            .get(map::KEY_ACTUAL_MAX_CURRENT)
            .or_else(|| snapshot.get(&map::socket_key(socket, map::KEY_SAFE_CURRENT)))
            .and_then(Value::as_f64)
            .map(|limit| limit as f32)
    }

    fn publish(&self, staged: HashMap<String, Value>) {
        let snapshot: Snapshot = Arc::new(staged);
        *self.shared.snapshot.write().unwrap() = Arc::clone(&snapshot);

        // Invoke outside the registry lock so listeners may subscribe or
        // unsubscribe from within a callback.
        let listeners: Vec<(u64, Listener)> =
            self.shared.listeners.lock().unwrap().clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                warn!(listener = id, "snapshot listener panicked");
            }
        }
    }

    async fn read_group(
        &self,
        unit: u8,
        group: &FieldGroup,
        socket: Option<u8>,
        staged: &mut HashMap<String, Value>,
    ) -> Result<()> {
        let words = self.read_registers(unit, group.start, group.count).await?;
        if words.len() != group.count as usize {
            return Err(Error::UnexpectedLength {
                expected: group.count,
                actual: words.len(),
            });
        }
        for field in group.fields {
            let offset = (field.addr - group.start) as usize;
            let end = offset + field.ty.quantity() as usize;
            match codec::decode(field.ty, &words[offset..end]) {
                Ok(value) => {
                    let key = match socket {
                        Some(socket) => map::socket_key(socket, field.key),
                        None => field.key.to_owned(),
                    };
                    staged.insert(key, value);
                }
                // Field omitted; the previous value stays in the snapshot.
                Err(err) => warn!(unit, field = field.key, %err, "decode failed"),
            }
        }
        Ok(())
    }

    async fn read_registers(
        &self,
        unit: u8,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        let timeout = self.shared.config.request_timeout();
        let mut guard = self.shared.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect_transport().await?);
        }
        let context = guard.as_mut().expect("transport attached above");
        context.set_slave(Slave(unit));

        let result =
            match tokio::time::timeout(timeout, context.read_holding_registers(addr, cnt)).await {
                Err(_) => Err(Error::Timeout(timeout)),
                Ok(Err(err)) => Err(Error::Transport(err)),
                Ok(Ok(Err(exception))) => Err(Error::Exception(exception)),
                Ok(Ok(Ok(words))) => Ok(words),
            };
        // A wedged or broken connection is dropped and re-established on the
        // next request; no partial data reaches the snapshot.
        if result.as_ref().is_err_and(Error::is_transport) {
            *guard = None;
        }
        result
    }

    async fn write_registers(&self, unit: u8, addr: Address, words: &[Word]) -> Result<()> {
        let timeout = self.shared.config.request_timeout();
        let mut guard = self.shared.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect_transport().await?);
        }
        let context = guard.as_mut().expect("transport attached above");
        context.set_slave(Slave(unit));

        let result = match tokio::time::timeout(timeout, context.write_multiple_registers(addr, words))
            .await
        {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(Err(err)) => Err(Error::Transport(err)),
            Ok(Ok(Err(exception))) => Err(Error::Exception(exception)),
            Ok(Ok(Ok(()))) => Ok(()),
        };
        if result.as_ref().is_err_and(Error::is_transport) {
            *guard = None;
        }
        result
    }

    async fn connect_transport(&self) -> Result<Context> {
        let config = &self.shared.config;
        let timeout = config.request_timeout();
        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))??;
        Ok(attach_slave(stream, Slave(config.station_unit)))
    }
}

/// Clamp a requested set-value against the observed hard limit, falling back
/// to the field's static maximum; reject values outside the absolute bounds
/// even after clamping.
fn clamped_value(requested: f32, limit: Option<f32>, bounds: Bounds) -> Result<f32> {
    if !requested.is_finite() {
        return Err(Error::Validation {
            value: requested,
            min: bounds.min,
            max: bounds.max,
        });
    }
    let ceiling = limit.unwrap_or(bounds.max).min(bounds.max);
    let value = requested.min(ceiling);
    if value < bounds.min {
        return Err(Error::Validation {
            value,
            min: bounds.min,
            max: bounds.max,
        });
    }
    Ok(value)
}
