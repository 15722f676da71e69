//! Writes a default gateway configuration file to edit from.

use clap::{Arg, Command};
use gatecore::GatewayConfig;
use std::fs;

fn main() {
    let matches = Command::new("Config Generator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Generates a default gateway configuration file.")
        .arg(
            Arg::new("CONFIG_FILE")
                .help("Path to write the config file to")
                .required(true),
        )
        .get_matches();

    let path = matches
        .get_one::<String>("CONFIG_FILE")
        .expect("CONFIG_FILE is required");

    let toml =
        serdeconv::to_toml_string(&GatewayConfig::default()).expect("Error rendering config");

    fs::write(path, toml).expect("Error writing config file");

    println!("Wrote {}", path);
}
