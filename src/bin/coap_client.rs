use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use simplelog::{ColorChoice, LevelFilter, SimpleLogger, TermLogger, TerminalMode};
use tokio_stream::StreamExt;

use coap_engine::client::{parse_coap_url, request_for_url, RequestOptions, UdpCoAPClient};
use coap_engine::{MessageType, Method, Packet, WELL_KNOWN_CORE};

/// A simple utility for interacting with CoAP services
#[derive(Parser, Debug)]
#[command(version)]
struct Options {
    /// Target URL for the CoAP operation, e.g. coap://127.0.0.1:5683/resource
    target: String,

    #[command(subcommand)]
    command: Command,

    /// Send non-confirmable requests
    #[arg(long)]
    non_confirmable: bool,

    /// Seconds to wait for a response
    #[arg(long, default_value_t = 93)]
    timeout: u64,

    /// Payload for PUT and POST
    #[arg(long, short)]
    data: Option<String>,

    /// Configure app logging levels
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Perform a GET request
    Get,
    /// Perform a PUT request
    Put,
    /// Perform a POST request
    Post,
    /// Perform a DELETE request
    Delete,
    /// Register an observer on the provided resource
    Observe,
    /// List the server's resources from /.well-known/core
    Discover,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> LevelFilter {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

fn print_response(response: &Packet) {
    info!("Response: {}", response);
    println!("{}", String::from_utf8_lossy(&response.payload));
}

fn url_request(
    target: &str,
    method: Method,
    data: Option<Vec<u8>>,
    non_confirmable: bool,
) -> std::io::Result<Packet> {
    let mut request = request_for_url(target, method, data)?;
    if non_confirmable {
        request.header.set_type(MessageType::NonConfirmable);
    }
    Ok(request)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load options
    let opts = Options::parse();

    // Initialise logging
    let level = LevelFilter::from(opts.log_level);
    let log_config = simplelog::ConfigBuilder::new().build();
    if TermLogger::init(level, log_config.clone(), TerminalMode::Mixed, ColorChoice::Auto).is_err() {
        SimpleLogger::init(level, log_config)?;
    }

    let (_scheme, host, port, resource) = parse_coap_url(&opts.target)?;

    info!("Connecting client to target: {:?}", opts.target);
    let mut client = UdpCoAPClient::new_udp((host.as_str(), port)).await?;
    client.set_request_options(RequestOptions {
        confirmable: !opts.non_confirmable,
        timeout: Duration::from_secs(opts.timeout),
    });
    let data = opts.data.map(String::into_bytes).unwrap_or_default();

    let response = match opts.command {
        Command::Get => {
            client
                .send(url_request(&opts.target, Method::Get, None, opts.non_confirmable)?)
                .await?
        }
        Command::Put => {
            client
                .send(url_request(&opts.target, Method::Put, Some(data), opts.non_confirmable)?)
                .await?
        }
        Command::Post => {
            client
                .send(url_request(&opts.target, Method::Post, Some(data), opts.non_confirmable)?)
                .await?
        }
        Command::Delete => {
            client
                .send(url_request(&opts.target, Method::Delete, None, opts.non_confirmable)?)
                .await?
        }
        Command::Discover => client.get(WELL_KNOWN_CORE).await?,
        Command::Observe => {
            let mut notifications = client.observe(&resource).await?;
            while let Some(notification) = notifications.next().await {
                match notification {
                    Ok(notification) => print_response(&notification),
                    Err(e) => {
                        error!("Observation ended: {}", e);
                        break;
                    }
                }
            }
            return Ok(());
        }
    };
    print_response(&response);
    client.shutdown().await?;
    Ok(())
}
