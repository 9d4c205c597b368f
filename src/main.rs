use std::{
    env, fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    process,
    str::FromStr,
    time::Duration,
};

use tokio::{runtime, signal};

mod ikev2;
mod logger;

enum Action {
    Serve(ikev2::Config),
}

pub struct Args {
    log_level: log::LevelFilter,
    action: Action,
}

const USAGE_INSTRUCTIONS: &str = "Usage: iketaskd [OPTIONS] serve\n\n\
Options:\
\n      --log-level=<LOG_LEVEL>          Log level [default: info]\
\n      --listen-ip=<IP>                 Listen IP address, multiple options can be provided [default: 0.0.0.0]\
\n      --port=<PORT>                    IKEv2 port [default: 500]\
\n      --nat-port=<PORT>                NAT-T port [default: 4500]\
\n      --id-hostname=<FQDN>             Hostname for identification [default: iketaskd]\
\n      --workers=<COUNT>                Number of worker threads processing IKE SAs [default: 4]\
\n      --retransmit-timeout=<SECONDS>   Initial retransmission timeout [default: 4]\
\n      --retransmit-tries=<COUNT>       Retransmissions before giving up [default: 5]\
\n      --peer=<IP:PORT>                 Peer to connect to, multiple options can be provided\
\n      --remote-id=<FQDN>               Expected identity of peers\
\n      --mobike=<BOOL>                  Enable MOBIKE (RFC 4555) [default: true]\
\n      --reauth-time=<SECONDS>          Reauthentication time, 0 disables [default: 10800]\
\n      --child-lifetime=<SECONDS>       CHILD_SA lifetime, 0 disables [default: 0]\
\n      --help                           Print help";

impl Args {
    fn parse() -> Args {
        let fail_with_error = |name: &str, value: &str, err: fmt::Arguments| {
            eprintln!(
                "Argument {} has an unsupported value {}: {}",
                name, value, err
            );
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };
        let parse_number = |name: &str, value: &str| -> u64 {
            match u64::from_str(value) {
                Ok(value) => value,
                Err(err) => {
                    fail_with_error(name, value, format_args!("Failed to parse number: {}", err));
                    process::exit(2);
                }
            }
        };

        let mut log_level = log::LevelFilter::Info;
        let mut listen_ips = vec![];
        let mut port = 500u16;
        let mut nat_port = 4500u16;
        let mut id_hostname = None;
        let mut workers = 4usize;
        let mut retransmit_timeout = Duration::from_secs(4);
        let mut retransmit_tries = 5usize;
        let mut peers = vec![];
        let mut remote_id = None;
        let mut mobike = true;
        let mut reauth_time = Some(Duration::from_secs(3 * 3600));
        let mut child_lifetime = None;

        for arg in env::args()
            .take(env::args().len().saturating_sub(1))
            .skip(1)
        {
            if arg == "--help" || arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            }
            let (name, value) = if let Some(arg) = arg.split_once('=') {
                arg
            } else {
                eprintln!("Option flag {} has no value", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            };

            if name == "--log-level" {
                log_level = match value.to_uppercase().as_str() {
                    "TRACE" => log::LevelFilter::Trace,
                    "DEBUG" => log::LevelFilter::Debug,
                    "INFO" => log::LevelFilter::Info,
                    "WARN" => log::LevelFilter::Warn,
                    "ERROR" => log::LevelFilter::Error,
                    "OFF" => log::LevelFilter::Off,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported log level"));
                        process::exit(2);
                    }
                };
            } else if name == "--listen-ip" {
                match IpAddr::from_str(value) {
                    Ok(ip) => {
                        listen_ips.push(ip);
                    }
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IP address: {}", err),
                    ),
                };
            } else if name == "--port" || name == "--nat-port" {
                let value = match u16::try_from(parse_number(name, value)) {
                    Ok(value) => value,
                    Err(err) => {
                        fail_with_error(name, value, format_args!("Port out of range: {}", err));
                        process::exit(2);
                    }
                };
                if name == "--port" {
                    port = value;
                } else {
                    nat_port = value;
                }
            } else if name == "--id-hostname" {
                id_hostname = Some(value.to_string());
            } else if name == "--workers" {
                workers = parse_number(name, value) as usize;
                if workers == 0 {
                    fail_with_error(name, value, format_args!("At least one worker is required"));
                }
            } else if name == "--retransmit-timeout" {
                retransmit_timeout = Duration::from_secs(parse_number(name, value));
            } else if name == "--retransmit-tries" {
                retransmit_tries = parse_number(name, value) as usize;
            } else if name == "--peer" {
                match SocketAddr::from_str(value) {
                    Ok(addr) => peers.push(addr),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse peer address: {}", err),
                    ),
                };
            } else if name == "--remote-id" {
                remote_id = Some(value.to_string());
            } else if name == "--mobike" {
                mobike = match value.to_lowercase().as_str() {
                    "true" | "yes" | "1" => true,
                    "false" | "no" | "0" => false,
                    _ => {
                        fail_with_error(name, value, format_args!("Expected true or false"));
                        process::exit(2);
                    }
                };
            } else if name == "--reauth-time" || name == "--child-lifetime" {
                let value = match parse_number(name, value) {
                    0 => None,
                    seconds => Some(Duration::from_secs(seconds)),
                };
                if name == "--reauth-time" {
                    reauth_time = value;
                } else {
                    child_lifetime = value;
                }
            } else {
                eprintln!("Unsupported argument {}", arg);
            }
        }

        let action = if let Some(action) = env::args().last() {
            action
        } else {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        match action.as_str() {
            "serve" => {
                if listen_ips.is_empty() {
                    listen_ips = vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)];
                }

                let action = Action::Serve(ikev2::Config {
                    port,
                    nat_port,
                    listen_ips,
                    hostname: id_hostname.unwrap_or_else(|| "iketaskd".to_string()),
                    workers,
                    retransmit_timeout,
                    retransmit_tries,
                    peers,
                    remote_id,
                    mobike,
                    reauth_time,
                    child_lifetime,
                });
                Args { log_level, action }
            }
            _ => {
                eprintln!("No action specified");
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            }
        }
    }
}

fn serve(config: ikev2::Config) -> Result<(), ikev2::IKEv2Error> {
    let mut server = ikev2::Server::new(config)?;
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        server.start().await?;
        if let Err(err) = signal::ctrl_c().await {
            log::error!("Failed to wait for CTRL+C signal: {}", err);
        }
        server.terminate().await
    })?;
    rt.shutdown_timeout(Duration::from_secs(5));
    log::info!("Stopped server");
    Ok(())
}

fn main() {
    println!(
        "iketaskd version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    let args = Args::parse();

    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    match args.action {
        Action::Serve(config) => {
            if let Err(err) = serve(config) {
                println!("Failed to run server, error is {}", err);
                process::exit(1);
            }
        }
    }
}
