//! Standalone Alfen Eve Single Pro Modbus TCP simulator.
//!
//! Serves the product/station device plus one or two socket units and runs
//! the mirror loop that acknowledges commanded max-current setpoints.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use alfen_modbus::simulator::{
    default_server_context, run_tcp_simulator, spawn_mirror_loop, Simulator,
};

#[derive(Parser, Debug)]
#[command(name = "alfen-simulator")]
#[command(about = "Alfen Eve Single Pro Modbus TCP simulator")]
#[command(version)]
struct Args {
    /// Address to bind
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// TCP port to listen on (502 is standard Modbus TCP)
    #[arg(short, long, default_value_t = 502)]
    port: u16,

    /// Unit id of the product/station device
    #[arg(long, default_value_t = 200)]
    station_unit: u8,

    /// Number of socket units to expose (1 or 2)
    #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=2))]
    sockets: u8,

    /// Mirror loop period in milliseconds
    #[arg(long, default_value_t = 1000)]
    mirror_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> alfen_modbus::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| alfen_modbus::Error::Config(err.to_string()))?;

    let socket_units: Vec<u8> = (1..=args.sockets).collect();
    let context = Arc::new(default_server_context(args.station_unit, &socket_units)?);

    if let Ok(station) = context.device(args.station_unit) {
        if let Some(identity) = station.identity() {
            info!(
                name = %identity.name,
                vendor = %identity.vendor,
                model = %identity.model,
                firmware = %identity.firmware,
                "simulated device"
            );
        }
    }

    let socket_addr = SocketAddr::new(args.bind, args.port);
    let listener = TcpListener::bind(socket_addr).await?;
    info!(%socket_addr, station_unit = args.station_unit, sockets = args.sockets, "listening");

    let mirror = spawn_mirror_loop(
        Arc::clone(&context),
        socket_units,
        Duration::from_millis(args.mirror_interval_ms),
    );

    let result = run_tcp_simulator(listener, Simulator::new(context)).await;
    mirror.abort();
    Ok(result?)
}
