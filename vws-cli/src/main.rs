//! vws: connect to a URL over plain TCP or TLS, send a payload, print replies.
//!
//! Replies are read until the socket timeout passes with no data or the peer
//! closes the connection.

mod config;

use std::io::{IsTerminal, Read, Write};

use anyhow::{bail, Context};
use clap::Parser;
use vws_core::{env, util, Error, Level, Socket, Url};

#[derive(Parser)]
#[command(name = "vws", version, about = "Send and receive over a vws socket")]
struct Cli {
    /// Target URL (ws/wss/http/https or any scheme with an explicit port)
    url: String,

    /// Use TLS even if the scheme does not imply it
    #[arg(long)]
    tls: bool,

    /// Payload to send; stdin is used when omitted and not a terminal
    #[arg(short, long)]
    data: Option<String>,

    /// Socket timeout in seconds (overrides config)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Allow partial writes (single attempt per write call)
    #[arg(long = "no-flush")]
    no_flush: bool,

    /// Trace threshold: debug, info, warn, error (overrides config)
    #[arg(long = "trace-level")]
    trace_level: Option<Level>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut cfg = config::load();
    if let Some(t) = cli.timeout {
        cfg.timeout_secs = t;
    }
    if let Some(l) = cli.trace_level {
        cfg.trace_level = l;
    }
    if cli.no_flush {
        cfg.flush = false;
    }
    env::set_trace_level(Some(cfg.trace_level));

    let url = Url::parse(&cli.url);
    if url.host.is_empty() {
        bail!("no host in {}", cli.url);
    }
    let port = url
        .port_number()
        .with_context(|| format!("no usable port in {}", cli.url))?;

    let payload = match cli.data {
        Some(d) => d.into_bytes(),
        None if !std::io::stdin().is_terminal() => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("reading stdin")?;
            buf
        }
        None => Vec::new(),
    };

    let mut socket = Socket::new();
    socket.set_timeout(cfg.timeout_secs);
    socket.set_flush(cfg.flush);
    socket
        .connect(&url.host, port, cli.tls || url.is_tls())
        .with_context(|| format!("connecting to {}:{}", url.host, port))?;
    if let Some((host, port)) = socket.peer_addr() {
        log::info!("connected to {}:{}", host, port);
    }

    let mut sent = 0;
    while sent < payload.len() {
        match socket.write(&payload[sent..]).context("sending payload")? {
            0 => util::msleep(10),
            n => sent += n,
        }
    }

    let mut out = std::io::stdout().lock();
    loop {
        match socket.read() {
            Ok(0) => break,
            Ok(_) => {
                let data = socket.buffer_mut().take();
                out.write_all(&data)?;
                out.flush()?;
            }
            Err(Error::Disconnected(reason)) => {
                log::info!("{}", reason);
                break;
            }
            Err(e) => return Err(e).context("receiving"),
        }
    }
    socket.close();
    Ok(())
}
