//! Runs a DNS forwarder in the foreground.
//!
//! Run with:
//!
//! cargo run --example forward [listen_addr] [upstream_addr] [options]
//!
//! Example:
//!
//! cargo run --example forward 127.0.0.1:5353 1.1.1.1:53
//!
//! Without addresses, it listens on 0.0.0.0:53 and forwards to 8.8.8.8:53.
//!
//! Options:
//! "--metrics": print the counters every 10 seconds.
//! "--logfile": write debug log to a file instead of stderr.
//!
//! For example, to see the debug log, set the RUST_LOG environment variable:
//!
//! RUST_LOG=dns_relay=debug cargo run --example forward 127.0.0.1:5353
//!
//! Then query it with: dig @127.0.0.1 -p 5353 example.com

use dns_relay::DnsForwarder;
use std::{env, fs::File, thread, time::Duration, time::SystemTime, time::UNIX_EPOCH};

fn main() {
    // Simple command line options.
    let args: Vec<String> = env::args().skip(1).collect();
    let mut show_metrics = false;
    let mut use_logfile = false;
    let mut addrs = Vec::new();

    for arg in args.iter() {
        match arg.as_str() {
            "--metrics" => show_metrics = true,
            "--logfile" => use_logfile = true,
            "-h" | "--help" => {
                print_usage();
                return;
            }
            other => addrs.push(other),
        }
    }

    if addrs.len() > 2 {
        print_usage();
        return;
    }

    // setup env_logger
    let mut builder = env_logger::Builder::from_default_env();
    if use_logfile {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards: failed to get UNIX timestamp");
        let log_filename = format!("dns-forward-{}.log", duration.as_secs());
        let file = File::create(&log_filename).expect("Failed to create the log file");
        builder.target(env_logger::Target::Pipe(Box::new(file)));
        println!("Logging to file: {}\n", log_filename);
    }

    // more precise timestamp.
    builder.format_timestamp_millis().init();

    let listen_addr = addrs.first().copied().unwrap_or("");
    let upstream_addr = addrs.get(1).copied().unwrap_or("");
    let forwarder = DnsForwarder::new(listen_addr, upstream_addr);

    if show_metrics {
        let monitor = forwarder.clone();
        thread::spawn(move || loop {
            thread::sleep(Duration::from_secs(10));
            let mut metrics: Vec<_> = monitor.get_metrics().into_iter().collect();
            metrics.sort();
            println!("Metrics: {:?}", metrics);
        });
    }

    if let Err(e) = forwarder.listen_and_serve() {
        eprintln!("Failed to run the forwarder: {}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("Usage: cargo run --example forward [listen_addr] [upstream_addr] [--metrics] [--logfile]");
    println!("Example: ");
    println!("cargo run --example forward 127.0.0.1:5353 1.1.1.1:53");
}
