//! Simulated Alfen Eve charging station: a multi-unit Modbus TCP server
//! exposing the register map of [`crate::map`], plus the mirror loop that
//! copies the commanded max current into the applied-current status register
//! after a bounded delay, the way the real station acknowledges a setpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Timelike};
use futures::future;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tokio_modbus::{Exception, Request, Response, SlaveRequest};
use tracing::{debug, warn};

use crate::codec::{self, Address, DataType, Quantity, Value, Word};
use crate::error::{Error, Result};
use crate::map;

/// Client-visible register `N` is stored at block index `N + 1`.
///
/// The offset is applied exactly once, in [`DeviceContext`]; seeding, the
/// mirror loop and the request service all go through it, so the field tables
/// stay offset-free and producer and consumer agree by construction.
pub const BLOCK_OFFSET: Address = 1;

const STORE_LEN: usize = 2000;

/// An ordered array of 16-bit cells owned by one logical device.
#[derive(Debug, Clone)]
pub struct RegisterStore {
    words: Vec<Word>,
}

impl Default for RegisterStore {
    fn default() -> Self {
        Self {
            words: vec![0; STORE_LEN],
        }
    }
}

impl RegisterStore {
    /// Read `cnt` consecutive cells starting at raw `index`.
    fn read(&self, index: Address, cnt: Quantity) -> Result<Vec<Word>> {
        let start = index as usize;
        let end = start + cnt as usize;
        if end > self.words.len() {
            return Err(Error::OutOfRange { addr: index, count: cnt });
        }
        Ok(self.words[start..end].to_vec())
    }

    /// Write `words` into consecutive cells starting at raw `index`.
    fn write(&mut self, index: Address, words: &[Word]) -> Result<()> {
        let start = index as usize;
        let end = start + words.len();
        if end > self.words.len() {
            return Err(Error::OutOfRange {
                addr: index,
                count: words.len() as Quantity,
            });
        }
        self.words[start..end].copy_from_slice(words);
        Ok(())
    }
}

/// Identity strings reported for a simulated device at startup.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub name: String,
    pub vendor: String,
    pub model: String,
    pub firmware: String,
}

/// One logical device: its register store plus an optional identity.
///
/// The store mutex is held for the duration of a single field access, so a
/// multi-register value is never read half-old/half-new, and the mirror loop
/// never starves a concurrent poll.
#[derive(Debug, Default)]
pub struct DeviceContext {
    store: Mutex<RegisterStore>,
    identity: Option<DeviceIdentity>,
}

impl DeviceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: DeviceIdentity) -> Self {
        Self {
            store: Mutex::new(RegisterStore::default()),
            identity: Some(identity),
        }
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// The top of the address space has no backing cell once shifted.
    fn index(addr: Address, cnt: Quantity) -> Result<Address> {
        addr.checked_add(BLOCK_OFFSET)
            .ok_or(Error::OutOfRange { addr, count: cnt })
    }

    /// Read registers at a client-visible address.
    pub fn read(&self, addr: Address, cnt: Quantity) -> Result<Vec<Word>> {
        let index = Self::index(addr, cnt)?;
        self.store.lock().unwrap().read(index, cnt)
    }

    /// Write registers at a client-visible address.
    pub fn write(&self, addr: Address, words: &[Word]) -> Result<()> {
        let index = Self::index(addr, words.len() as Quantity)?;
        self.store.lock().unwrap().write(index, words)
    }

    /// Encode `value` as `ty` and write it at a client-visible address.
    pub fn seed(&self, addr: Address, ty: DataType, value: &Value) -> Result<()> {
        self.write(addr, &codec::encode(ty, value)?)
    }

    #[cfg(test)]
    fn raw(&self, index: Address) -> Word {
        self.store.lock().unwrap().words[index as usize]
    }
}

/// Routes a read/write by unit id to the owning device's store.
///
/// Devices may be registered and withdrawn at runtime; a request for a
/// withdrawn unit fails with `UnknownDevice`, never with stale data.
#[derive(Debug, Default)]
pub struct ServerContext {
    devices: RwLock<HashMap<u8, Arc<DeviceContext>>>,
}

impl ServerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, unit: u8, device: DeviceContext) {
        self.devices.write().unwrap().insert(unit, Arc::new(device));
    }

    pub fn remove(&self, unit: u8) -> Option<Arc<DeviceContext>> {
        self.devices.write().unwrap().remove(&unit)
    }

    pub fn device(&self, unit: u8) -> Result<Arc<DeviceContext>> {
        self.devices
            .read()
            .unwrap()
            .get(&unit)
            .cloned()
            .ok_or(Error::UnknownDevice(unit))
    }

    pub fn read(&self, unit: u8, addr: Address, cnt: Quantity) -> Result<Vec<Word>> {
        self.device(unit)?.read(addr, cnt)
    }

    pub fn write(&self, unit: u8, addr: Address, words: &[Word]) -> Result<()> {
        self.device(unit)?.write(addr, words)
    }

    pub fn units(&self) -> Vec<u8> {
        self.devices.read().unwrap().keys().copied().collect()
    }
}

fn exception_for(err: &Error) -> Exception {
    match err {
        Error::UnknownDevice(_) => Exception::GatewayTargetDevice,
        Error::OutOfRange { .. } => Exception::IllegalDataAddress,
        _ => Exception::ServerDeviceFailure,
    }
}

/// The Modbus TCP service dispatching on the MBAP unit id.
///
/// Only holding-register reads and writes are served; everything else is
/// answered with `IllegalFunction`.
#[derive(Debug, Clone)]
pub struct Simulator {
    context: Arc<ServerContext>,
}

impl Simulator {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self { context }
    }
}

impl tokio_modbus::server::Service for Simulator {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = Exception;
    type Future = future::Ready<std::result::Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let unit = req.slave;
        let result = match req.request {
            Request::ReadHoldingRegisters(addr, cnt) => self
                .context
                .read(unit, addr, cnt)
                .map(Response::ReadHoldingRegisters),
            Request::WriteMultipleRegisters(addr, words) => self
                .context
                .write(unit, addr, &words)
                .map(|()| Response::WriteMultipleRegisters(addr, words.len() as u16)),
            Request::WriteSingleRegister(addr, word) => self
                .context
                .write(unit, addr, std::slice::from_ref(&word))
                .map(|()| Response::WriteSingleRegister(addr, word)),
            other => {
                debug!(unit, request = ?other, "unimplemented function code");
                return future::ready(Err(Exception::IllegalFunction));
            }
        };
        future::ready(result.map_err(|err| {
            warn!(unit, %err, "request failed");
            exception_for(&err)
        }))
    }
}

/// Seed the product/station device (unit 200 on real hardware).
pub fn station_context(now: DateTime<Local>, socket_count: u16) -> Result<DeviceContext> {
    let device = DeviceContext::with_identity(DeviceIdentity {
        name: "Eve Single Pro-line Simulator".to_owned(),
        vendor: "Alfen B.V.".to_owned(),
        model: "NG920".to_owned(),
        firmware: "5.16.0".to_owned(),
    });

    let entries = [
        (100, DataType::Str(34), Value::Str("Alfen Eve Single Pro-line".to_owned())),
        (117, DataType::Str(10), Value::Str("Alfen B.V.".to_owned())),
        (122, DataType::U16, Value::U16(3)),
        (123, DataType::Str(34), Value::Str("5.16.0-4095".to_owned())),
        (140, DataType::Str(34), Value::Str("NG920-60559".to_owned())),
        (157, DataType::Str(22), Value::Str("ACE0108752".to_owned())),
        (168, DataType::I16, Value::I16(now.year() as i16)),
        (169, DataType::I16, Value::I16(now.month() as i16)),
        (170, DataType::I16, Value::I16(now.day() as i16)),
        (171, DataType::I16, Value::I16(now.hour() as i16)),
        (172, DataType::I16, Value::I16(now.minute() as i16)),
        (173, DataType::I16, Value::I16(now.second() as i16)),
        (174, DataType::U64, Value::U64(3_600_000)),
        (178, DataType::I16, Value::I16(60)),
        (1100, DataType::F32, Value::F32(32.0)),
        (1102, DataType::F32, Value::F32(42.5)),
        (1104, DataType::U16, Value::U16(1)),
        (1105, DataType::U16, Value::U16(socket_count)),
    ];
    for (addr, ty, value) in entries {
        device.seed(addr, ty, &value)?;
    }
    Ok(device)
}

/// Seed one socket device (unit 1 or 2) with steady three-phase charging
/// around 10 A per phase.
pub fn socket_context() -> Result<DeviceContext> {
    let device = DeviceContext::new();

    let entries = [
        (300, DataType::U16, Value::U16(3)),
        (301, DataType::U64, Value::U64(1_500)),
        (305, DataType::U16, Value::U16(1)),
        (306, DataType::F32, Value::F32(232.5)),
        (308, DataType::F32, Value::F32(231.8)),
        (310, DataType::F32, Value::F32(233.2)),
        (312, DataType::F32, Value::F32(401.2)),
        (314, DataType::F32, Value::F32(400.8)),
        (316, DataType::F32, Value::F32(402.1)),
        (318, DataType::F32, Value::F32(0.12)),
        (320, DataType::F32, Value::F32(10.2)),
        (322, DataType::F32, Value::F32(10.1)),
        (324, DataType::F32, Value::F32(10.3)),
        (326, DataType::F32, Value::F32(30.6)),
        (328, DataType::F32, Value::F32(0.98)),
        (330, DataType::F32, Value::F32(0.97)),
        (332, DataType::F32, Value::F32(0.98)),
        (334, DataType::F32, Value::F32(0.98)),
        (336, DataType::F32, Value::F32(50.02)),
        (338, DataType::F32, Value::F32(2325.0)),
        (340, DataType::F32, Value::F32(2298.0)),
        (342, DataType::F32, Value::F32(2356.0)),
        (344, DataType::F32, Value::F32(6979.0)),
        (346, DataType::F32, Value::F32(2372.0)),
        (348, DataType::F32, Value::F32(2348.0)),
        (350, DataType::F32, Value::F32(2404.0)),
        (352, DataType::F32, Value::F32(7124.0)),
        (354, DataType::F32, Value::F32(465.0)),
        (356, DataType::F32, Value::F32(502.0)),
        (358, DataType::F32, Value::F32(454.0)),
        (360, DataType::F32, Value::F32(1421.0)),
        (362, DataType::F64, Value::F64(15234.67)),
        (366, DataType::F64, Value::F64(15198.42)),
        (370, DataType::F64, Value::F64(15312.89)),
        (374, DataType::F64, Value::F64(45745.98)),
        (378, DataType::F64, Value::F64(0.0)),
        (382, DataType::F64, Value::F64(0.0)),
        (386, DataType::F64, Value::F64(0.0)),
        (390, DataType::F64, Value::F64(0.0)),
        (392, DataType::F64, Value::F64(15542.0)),
        (396, DataType::F64, Value::F64(15485.0)),
        (400, DataType::F64, Value::F64(15612.0)),
        (404, DataType::F64, Value::F64(46639.0)),
        (408, DataType::F64, Value::F64(3024.0)),
        (412, DataType::F64, Value::F64(3189.0)),
        (416, DataType::F64, Value::F64(2956.0)),
        (1200, DataType::U16, Value::U16(1)),
        (1201, DataType::Str(10), Value::Str("C2".to_owned())),
        (1206, DataType::F32, Value::F32(16.0)),
        (1208, DataType::U32, Value::U32(60)),
        (1210, DataType::F32, Value::F32(16.0)),
        (1212, DataType::F32, Value::F32(6.0)),
        (1214, DataType::U16, Value::U16(1)),
        (1215, DataType::U16, Value::U16(3)),
    ];
    for (addr, ty, value) in entries {
        device.seed(addr, ty, &value)?;
    }
    Ok(device)
}

/// Assemble the default simulated station: product device plus socket units.
pub fn default_server_context(station_unit: u8, socket_units: &[u8]) -> Result<ServerContext> {
    let context = ServerContext::new();
    context.insert(
        station_unit,
        station_context(Local::now(), socket_units.len() as u16)?,
    );
    for &unit in socket_units {
        context.insert(unit, socket_context()?);
    }
    Ok(context)
}

/// Periodically copy the commanded max current (1210) into the
/// actual-applied register (1206) on every socket unit, emulating the
/// latency of the physical actuator. The copy is unconditional and
/// idempotent; it goes through the same per-device lock as the service.
pub fn spawn_mirror_loop(
    context: Arc<ServerContext>,
    units: Vec<u8>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        loop {
            tick.tick().await;
            for &unit in &units {
                match context.read(unit, map::SLAVE_MAX_CURRENT_ADDR, DataType::F32.quantity()) {
                    Ok(words) => {
                        if let Err(err) =
                            context.write(unit, map::ACTUAL_APPLIED_MAX_CURRENT_ADDR, &words)
                        {
                            warn!(unit, %err, "mirror write failed");
                        }
                    }
                    Err(err) => warn!(unit, %err, "mirror read failed"),
                }
            }
        }
    })
}

/// Serve the simulator on an already-bound listener until the task is
/// aborted. Binding is left to the caller so tests can use port 0.
pub async fn run_tcp_simulator(listener: TcpListener, simulator: Simulator) -> std::io::Result<()> {
    let server = Server::new(listener);
    let new_service = |_socket_addr| Ok(Some(simulator.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        warn!(%err, "connection failed");
    };
    server.serve(&on_connected, on_process_error).await
}

/// Spawn the TCP server as a background task.
pub fn spawn_tcp_simulator(listener: TcpListener, simulator: Simulator) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = run_tcp_simulator(listener, simulator).await {
            warn!(%err, "simulator server terminated");
        }
    })
}
