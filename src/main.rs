use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use env_logger::Env;
use log::info;

use drishti_edge::config::{AppConfig, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};
use drishti_edge::mock::MockClientOptions;
use drishti_edge::{DrishtiServer, Error, Result};

const DEFAULT_CONFIG_PATH: &str = "drishti-edge.toml";

struct Args {
    config: Option<PathBuf>,
    tcp_port: Option<u16>,
    udp_port: Option<u16>,
    mock_dir: Option<PathBuf>,
    write_dir: Option<PathBuf>,
}

fn print_usage() {
    eprintln!(
        "drishti-edge - edge server for live mobile video and sensor streams

USAGE:
    drishti-edge [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Configuration file (default: {DEFAULT_CONFIG_PATH})
        --tcp-port <PORT>  TCP control port (default: {DEFAULT_TCP_PORT})
        --udp-port <PORT>  UDP frame port (default: {DEFAULT_UDP_PORT})
        --mock <DIR>       Replay *.jpg frames from DIR as an in-process client
        --write-dir <DIR>  Archive inbound frames to DIR
    -h, --help             Show this help"
    );
}

fn next_value(iter: &mut impl Iterator<Item = String>, flag: &str) -> Option<String> {
    let value = iter.next();
    if value.is_none() {
        eprintln!("missing value for {flag}");
    }
    value
}

fn parse_port(value: &str) -> Option<u16> {
    match value.parse() {
        Ok(port) => Some(port),
        Err(_) => {
            eprintln!("invalid port {value:?}");
            None
        }
    }
}

fn parse_args() -> Option<Args> {
    let mut args = Args {
        config: None,
        tcp_port: None,
        udp_port: None,
        mock_dir: None,
        write_dir: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                args.config = Some(PathBuf::from(next_value(&mut iter, &arg)?));
            }
            "--tcp-port" => {
                args.tcp_port = Some(parse_port(&next_value(&mut iter, &arg)?)?);
            }
            "--udp-port" => {
                args.udp_port = Some(parse_port(&next_value(&mut iter, &arg)?)?);
            }
            "--mock" => {
                args.mock_dir = Some(PathBuf::from(next_value(&mut iter, &arg)?));
            }
            "--write-dir" => {
                args.write_dir = Some(PathBuf::from(next_value(&mut iter, &arg)?));
            }
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            _ => {
                eprintln!("unknown argument {arg:?}");
                return None;
            }
        }
    }
    Some(args)
}

fn load_config(args: &Args, default_path: &Path) -> Result<AppConfig> {
    let mut config = match &args.config {
        // An explicitly named file has to exist.
        Some(path) => AppConfig::from_file(path)?,
        None => {
            if default_path.exists() {
                AppConfig::from_file(default_path)?
            } else {
                AppConfig::default()
            }
        }
    };
    if let Some(port) = args.tcp_port {
        config.network.tcp_port = port;
    }
    if let Some(port) = args.udp_port {
        config.network.udp_port = port;
    }
    if let Some(dir) = &args.write_dir {
        config.pipeline.write_dir = Some(dir.clone());
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = match parse_args() {
        Some(args) => args,
        None => {
            print_usage();
            std::process::exit(2);
        }
    };
    let config = load_config(&args, Path::new(DEFAULT_CONFIG_PATH))?;
    env_logger::Builder::from_env(Env::default().default_filter_or(&config.logging.level)).init();

    info!("drishti-edge {}", env!("CARGO_PKG_VERSION"));
    if args.config.is_none() && !Path::new(DEFAULT_CONFIG_PATH).exists() {
        info!("no {DEFAULT_CONFIG_PATH} found, using defaults");
    }

    let server = DrishtiServer::start(config)?;
    if let Some(dir) = args.mock_dir {
        let session = server.add_mock_client(MockClientOptions::new(dir))?;
        info!("mock client running as session {session}");
    }

    let running = server.running();
    let handler_flag = running.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::Relaxed);
    })
    .map_err(|err| Error::Other(format!("could not install the signal handler: {err}")))?;

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }
    server.stop();
    Ok(())
}
