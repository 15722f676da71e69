use clap::{Arg, Command};
use flint::logging;
use flint::time::SystemClock;
use gatecore::{Gateway, GatewayConfig};
use strata::fs::DiskVolume;

mod net;
mod serial;

fn main() {
    let matches = Command::new("Gateway Runner")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the edge gateway core.")
        .arg(
            Arg::new("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .arg(
            Arg::new("SERIAL_PORT")
                .help("Path to the RS-485 serial device")
                .required(true),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("CONFIG_FILE")
        .expect("CONFIG_FILE is required");
    let serial_path = matches
        .get_one::<String>("SERIAL_PORT")
        .expect("SERIAL_PORT is required");

    let config = GatewayConfig::load(config_path).expect("Error loading gateway configuration");

    let log = logging::terminal();

    logging::info!(log, "starting gateway";
                   "device_id" => &config.device_id,
                   "serial" => serial_path.as_str(),
                   "server" => &config.server_url);

    if config.use_https {
        // TLS termination is an external collaborator (local proxy or
        // TLS-wrapping dialer); the built-in dialer speaks plain TCP.
        logging::warn!(log, "use_https set: expecting a TLS-terminating proxy on the server endpoint");
    }

    let port = serial::SerialBusPort::open(serial_path, config.bus_baud, config.bus_parity)
        .expect("Error opening serial port");

    let volume = DiskVolume::new(config.data_dir.clone());
    let dialer = net::TcpDialer::new();

    let mut gateway = Gateway::new(config, port, volume, dialer, SystemClock, &log)
        .expect("Error constructing gateway");

    gateway.startup();

    logging::info!(log, "gateway running");

    gateway.run();
}
