use std::net::{Ipv4Addr, SocketAddrV4};
use std::process;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{App, Arg};
use flux::logging::{error, info};

use cncnet_relay::config::Configuration;
use cncnet_relay::engine::Server;

fn build_app() -> App<'static, 'static> {
    App::new("cncnet-relay")
        .version("1.0")
        .about("UDP relay server for LAN-style peer-to-peer games tunneled over the Internet")
        .arg(
            Arg::with_name("PORT")
                .help("UDP port to listen on (default: 9000)")
                .required(false)
                .index(1),
        )
        .arg(
            Arg::with_name("ip")
                .short("i")
                .long("ip")
                .takes_value(true)
                .help("Local address to bind to (default: 0.0.0.0)"),
        )
        .arg(
            Arg::with_name("hostname")
                .short("n")
                .long("name")
                .takes_value(true)
                .help("Hostname reported in QUERY responses"),
        )
        .arg(
            Arg::with_name("password")
                .short("p")
                .long("password")
                .takes_value(true)
                .help("Admin password required to issue RESET"),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .takes_value(true)
                .help("Idle peer timeout in seconds (default: 60)"),
        )
        .arg(
            Arg::with_name("maxclients")
                .short("c")
                .long("clients")
                .takes_value(true)
                .help("Maximum connected peers (default: 8)"),
        )
        .arg(
            Arg::with_name("link")
                .short("l")
                .long("link")
                .takes_value(true)
                .help("Sibling relay address to mirror broadcast traffic to, host[:port]"),
        )
        .arg(
            Arg::with_name("help_alt")
                .short("?")
                .long("help-alt")
                .hidden(true)
                .help("Alias for --help"),
        )
}

fn main() {
    let matches = build_app().get_matches_safe().unwrap_or_else(|e| {
        // clap's default exits 0 for a help/version request; the usage contract here is
        // exit 1 for *any* usage request or parse failure, matching `-h`/`-?`/the
        // unknown-argument default case in the original CLI.
        eprintln!("{}", e.message);
        process::exit(1);
    });

    if matches.is_present("help_alt") {
        let _ = build_app().print_help();
        println!();
        process::exit(1);
    }

    let log = flux::logging::init("info");

    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(msg) => {
            error!(log, "invalid configuration"; "reason" => %msg);
            process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    }) {
        error!(log, "failed to install signal handler"; "error" => %e);
        process::exit(1);
    }

    let mut server = match Server::new(config, log.clone()) {
        Ok(server) => server,
        Err(e) => {
            error!(log, "failed to start relay"; "error" => %e);
            process::exit(1);
        }
    };

    if let Err(e) = server.run(&running) {
        error!(log, "relay stopped with an error"; "error" => %e);
        process::exit(1);
    }

    info!(log, "goodbye");
}

const DEFAULT_PORT: u16 = 9000;
const MIN_PORT: u16 = 1024;

fn build_config(matches: &clap::ArgMatches) -> Result<Configuration, String> {
    let port: u16 = match matches.value_of("PORT") {
        Some(s) => s.parse().map_err(|_| "PORT must be a number between 0 and 65535".to_string())?,
        None => DEFAULT_PORT,
    };
    let port = port.clamp(MIN_PORT, u16::MAX);

    let ip = match matches.value_of("ip") {
        Some(s) => Ipv4Addr::from_str(s).map_err(|_| format!("invalid bind address: {}", s))?,
        None => Ipv4Addr::UNSPECIFIED,
    };

    let hostname = matches
        .value_of("hostname")
        .unwrap_or("Unnamed CnCNet Dedicated Server")
        .to_string();
    let password = matches.value_of("password").map(|s| s.to_string());

    let timeout_secs: u64 = match matches.value_of("timeout") {
        Some(s) => s.parse().map_err(|_| "timeout must be a number".to_string())?,
        None => 60,
    };

    let max_clients: usize = match matches.value_of("maxclients") {
        Some(s) => s.parse().map_err(|_| "clients must be a number".to_string())?,
        None => 8,
    };

    let link = match matches.value_of("link") {
        Some(s) => Some(parse_link(s)?),
        None => None,
    };

    Ok(Configuration::new(
        ip,
        port,
        hostname,
        password,
        timeout_secs,
        max_clients,
        link,
    ))
}

fn parse_link(s: &str) -> Result<SocketAddrV4, String> {
    const DEFAULT_LINK_PORT: u16 = 9000;

    match s.split_once(':') {
        Some((host, port)) => {
            let ip = Ipv4Addr::from_str(host).map_err(|_| format!("invalid link address: {}", s))?;
            let port: u16 = port.parse().map_err(|_| format!("invalid link port: {}", s))?;
            Ok(SocketAddrV4::new(ip, port))
        }
        None => {
            let ip = Ipv4Addr::from_str(s).map_err(|_| format!("invalid link address: {}", s))?;
            Ok(SocketAddrV4::new(ip, DEFAULT_LINK_PORT))
        }
    }
}
