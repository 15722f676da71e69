//! Inspects a gateway storage directory: per-segment record counts, seal
//! state and torn-tail diagnostics. Read-only; safe to run against a live
//! data directory copy.

use clap::{Arg, Command};
use strata::fs::{DiskVolume, Volume};
use strata::segment::{self, SegmentKind};

fn main() {
    let matches = Command::new("Store Dump")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Inspects gateway storage segments.")
        .arg(
            Arg::new("DATA_DIR")
                .help("Path to the gateway data directory")
                .required(true),
        )
        .get_matches();

    let data_dir = matches
        .get_one::<String>("DATA_DIR")
        .expect("DATA_DIR is required");

    let volume = DiskVolume::new(data_dir.clone());

    for &kind in &SegmentKind::ALL {
        let names = match volume.list(kind.dir()) {
            Ok(names) => names,
            Err(err) => {
                eprintln!("{}: unreadable ({})", kind.dir(), err);
                continue;
            }
        };

        let segments: Vec<String> = names
            .into_iter()
            .filter(|name| segment::parse_name(kind, name).is_some())
            .collect();

        if segments.is_empty() {
            continue;
        }

        println!("{}:", kind.dir());

        for name in segments {
            match segment::scan(&volume, &name) {
                Ok(scan) => {
                    let sealed = if segment::is_sealed(&volume, &name) {
                        match segment::verify_seal(&volume, &name) {
                            Ok(()) => "sealed",
                            Err(_) => "SEAL MISMATCH",
                        }
                    } else {
                        "active"
                    };

                    let tail = if scan.torn { ", torn tail" } else { "" };

                    println!(
                        "  {}  {} entries, {} bytes, {}{}",
                        name,
                        scan.entries.len(),
                        scan.good_len,
                        sealed,
                        tail
                    );
                }
                Err(err) => println!("  {}  UNREADABLE ({:?})", name, err),
            }
        }
    }
}
