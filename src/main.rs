//! kexuedns binary entry point
//!
//! Loads the configuration, wires the forwarder to the management API,
//! starts everything, and shuts down cleanly on SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config directory ($XDG_CONFIG_HOME/kexuedns)
//! kexuedns
//!
//! # Write a default config and exit
//! kexuedns --config-init
//!
//! # Custom config directory and API address
//! kexuedns --config-dir /etc/kexuedns --http-addr 127.0.0.1 --http-port 5580
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kexuedns::api::{api_router, ApiState};
use kexuedns::config::myip::MyIp;
use kexuedns::config::{self, Config, TlsListenFile};
use kexuedns::dns::server::{Forwarder, ListenConfig, TlsIdentity};
use kexuedns::dns::Router;

const PROGNAME: &str = "KexueDNS";

/// Command-line arguments.
struct Args {
    /// Enable debug logging regardless of `--log-level`.
    debug: bool,
    /// Log level: debug/info/notice/warn/error.
    log_level: String,
    /// Configuration directory.
    config_dir: Option<PathBuf>,
    /// Write the default config and exit.
    config_init: bool,
    /// Management API address.
    http_addr: String,
    /// Management API port.
    http_port: u16,
    /// Print version and exit.
    show_version: bool,
}

impl Args {
    fn parse() -> Self {
        let mut parsed = Self {
            debug: false,
            log_level: "info".to_string(),
            config_dir: None,
            config_init: false,
            http_addr: "127.0.0.1".to_string(),
            http_port: 5580,
            show_version: false,
        };

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--debug" => parsed.debug = true,
                "--log-level" => {
                    if let Some(level) = args.next() {
                        parsed.log_level = level;
                    }
                }
                "--config-dir" => {
                    if let Some(dir) = args.next() {
                        parsed.config_dir = Some(PathBuf::from(dir));
                    }
                }
                "--config-init" => parsed.config_init = true,
                "--http-addr" => {
                    if let Some(addr) = args.next() {
                        parsed.http_addr = addr;
                    }
                }
                "--http-port" => {
                    if let Some(port) = args.next() {
                        match port.parse() {
                            Ok(port) => parsed.http_port = port,
                            Err(_) => {
                                eprintln!("Invalid --http-port: {port}");
                                std::process::exit(1);
                            }
                        }
                    }
                }
                "--version" => parsed.show_version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        parsed
    }
}

fn print_help() {
    println!(
        r"{PROGNAME} v{}

DNS forwarder with EDNS-Client-Subnet injection and zone-based routing.

USAGE:
    kexuedns [OPTIONS]

OPTIONS:
    --debug               Enable debug logging
    --log-level <LEVEL>   Log level: debug/info/notice/warn/error [default: info]
    --config-dir <DIR>    Config directory [default: $XDG_CONFIG_HOME/kexuedns]
    --config-init         Write the default config and exit
    --http-addr <ADDR>    Management API address [default: 127.0.0.1]
    --http-port <PORT>    Management API port [default: 5580]
    --version             Print version information
    -h, --help            Print help information
",
        kexuedns::VERSION
    );
}

fn init_tracing(args: &Args) {
    let level = if args.debug {
        "debug"
    } else {
        match args.log_level.as_str() {
            "debug" => "debug",
            // No notice level in tracing; fold it into info.
            "info" | "notice" => "info",
            "warn" => "warn",
            "error" => "error",
            other => {
                eprintln!("Unknown log level [{other}]; using info");
                "info"
            }
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kexuedns={level},info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(level, "set log level");
}

fn config_dir(args: &Args) -> Result<PathBuf> {
    if let Some(dir) = &args.config_dir {
        return Ok(dir.clone());
    }
    match std::env::var_os("XDG_CONFIG_HOME") {
        Some(base) if !base.is_empty() => {
            let dir = PathBuf::from(base).join(PROGNAME.to_lowercase());
            info!(dir = %dir.display(), "use default config directory");
            Ok(dir)
        }
        _ => bail!("${{XDG_CONFIG_HOME}} required but missing; use --config-dir"),
    }
}

/// Build the optional TLS listen config for DoT/DoH from the file form.
fn tls_listen(config: &Config, listen: &TlsListenFile) -> Result<Option<ListenConfig>> {
    if listen.addr.is_empty() {
        return Ok(None);
    }
    let ip: IpAddr = listen
        .addr
        .parse()
        .with_context(|| format!("invalid listen address [{}]", listen.addr))?;

    if listen.cert_file.is_empty() || listen.key_file.is_empty() {
        bail!("listener at {} requires cert_file and key_file", listen.addr);
    }
    let identity = TlsIdentity::load(
        &config.resolve_path(&listen.cert_file),
        &config.resolve_path(&listen.key_file),
    )?;

    Ok(Some(ListenConfig::with_tls(
        SocketAddr::new(ip, listen.port),
        identity,
    )))
}

fn build_forwarder(config: &Config, router: Arc<Router>, myip: Arc<MyIp>) -> Result<Forwarder> {
    let listen_ip: IpAddr = config
        .file
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address [{}]", config.file.listen_addr))?;
    let listen = ListenConfig::plain(SocketAddr::new(listen_ip, config.file.listen_port));

    let listen_dot = match &config.file.listen_dot {
        Some(l) => tls_listen(config, l)?,
        None => None,
    };
    let listen_doh = match &config.file.listen_doh {
        Some(l) => tls_listen(config, l)?,
        None => None,
    };

    Ok(Forwarder::new(router, myip)
        .with_listen(Some(listen))
        .with_listen_dot(listen_dot)
        .with_listen_doh(listen_doh))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.show_version {
        let v = config::version();
        println!("{PROGNAME} {} ({})", v.version, v.date);
        return Ok(());
    }

    init_tracing(&args);

    let dir = config_dir(&args)?;
    if args.config_init {
        config::init(&dir).context("failed to initialize config")?;
        return Ok(());
    }

    let config = Arc::new(config::load(&dir).context("failed to load config")?);

    let myip = Arc::new(MyIp::new());
    let router = Arc::new(Router::new(Arc::clone(&config.roots)));
    let forwarder = Arc::new(build_forwarder(&config, router, Arc::clone(&myip))?);

    // Management API.
    let api_addr: SocketAddr = format!("{}:{}", args.http_addr, args.http_port)
        .parse()
        .with_context(|| format!("invalid http-addr [{}]", args.http_addr))?;
    let state = ApiState {
        forwarder: Arc::clone(&forwarder),
        config: Arc::clone(&config),
        myip,
    };
    let app = axum::Router::new().nest("/api", api_router(state));
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to listen at {api_addr}"))?;
    info!(addr = %api_addr, "management API listening");

    // Start the forwarder with the configured resolver. A failure here
    // is not fatal: the API stays up so the configuration can be fixed.
    match &config.file.resolver {
        None => warn!("no resolver configured yet"),
        Some(export) => {
            if let Err(e) = forwarder.router().set_resolver(export).await {
                warn!(error = %e, "failed to set configured resolver");
            }
        }
    }
    if let Err(e) = forwarder.start().await {
        warn!(error = %e, "failed to start forwarder");
    }

    let server = std::future::IntoFuture::into_future(axum::serve(api_listener, app));
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "management API server failed");
            }
        }
        () = shutdown_signal() => {
            info!("signal received; shutting down");
        }
    }

    forwarder.stop().await;
    info!("done; exiting");
    Ok(())
}
