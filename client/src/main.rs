//! NanoCam Client – requests images and video from a capture server.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use nanocam_client::{ClientOptions, MediaClient, Reply};
use nanocam_common::config::{self, Config};
use nanocam_common::protocol::{Format, Request};

#[derive(Parser)]
#[command(name = "nanocam-client", about = "Request captures from a NanoCam server")]
struct Cli {
    /// Configuration file (KEY=VALUE).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Server address, overriding SERVER_ADDR.
    #[arg(long)]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture still images.
    Image {
        #[arg(long, default_value_t = 1)]
        frames: u32,
        /// Seconds between frames.
        #[arg(long, default_value_t = 0)]
        interval: u64,
        #[arg(long, default_value_t = 3280)]
        width: u32,
        #[arg(long, default_value_t = 2464)]
        height: u32,
        #[arg(long, value_enum, default_value_t = CliFormat::File)]
        format: CliFormat,
        /// Kill a running stream instead of giving up on BUSY.
        #[arg(long = "override")]
        override_busy: bool,
    },
    /// Record or stream video.
    Video {
        /// Seconds.
        #[arg(long, default_value_t = 10)]
        duration: u64,
        #[arg(long, default_value_t = 1920)]
        width: u32,
        #[arg(long, default_value_t = 1080)]
        height: u32,
        #[arg(long, value_enum, default_value_t = CliFormat::File)]
        format: CliFormat,
        #[arg(long = "override")]
        override_busy: bool,
    },
    /// Stop the active stream.
    Kill,
    /// Extend the active stream to SECONDS from now.
    ResetTimer { seconds: u64 },
}

#[derive(Clone, Copy, ValueEnum)]
enum CliFormat {
    Opencv,
    File,
    Udp,
}

impl From<CliFormat> for Format {
    fn from(f: CliFormat) -> Self {
        match f {
            CliFormat::Opencv => Format::Opencv,
            CliFormat::File => Format::File,
            CliFormat::Udp => Format::Udp,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // ── load config ──────────────────────────────────────────────────
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(Config::default_path()));
    let mut config = config::load_or_default(&config_path).context("Config load failed")?;
    if let Some(server) = cli.server {
        config.server_addr = server;
    }

    let mut client = MediaClient::connect(ClientOptions::from_config(&config))
        .with_context(|| format!("Cannot connect to {}", config.server_addr))?;

    match cli.command {
        Command::Image {
            frames,
            interval,
            width,
            height,
            format,
            override_busy,
        } => {
            let request = Request::Image {
                width,
                height,
                frames,
                interval,
                format: format.into(),
            };
            let reply = client.request(&request, override_busy)?;
            report(reply)?;
        }
        Command::Video {
            duration,
            width,
            height,
            format,
            override_busy,
        } => {
            let request = Request::Video {
                width,
                height,
                duration,
                format: format.into(),
            };
            let reply = client.request(&request, override_busy)?;
            report(reply)?;
        }
        Command::Kill => match client.kill()? {
            Some(reply) => report(reply)?,
            None => println!("OK"),
        },
        Command::ResetTimer { seconds } => {
            client.reset_timer(seconds)?;
            info!("Timer reset to {seconds}s");
        }
    }

    client.close()?;
    Ok(())
}

/// Print the result. A udp stream is received until it goes idle or Ctrl-C.
fn report(reply: Reply) -> Result<()> {
    match reply {
        Reply::Busy => println!("BUSY – camera in use (retry with --override)"),
        Reply::Files(files) => {
            for path in &files.paths {
                println!("{}", path.display());
            }
            if !files.complete {
                anyhow::bail!("transfer incomplete – {} file(s) received", files.paths.len());
            }
        }
        Reply::Frames(frames) => {
            for frame in &frames.frames {
                println!("{} ({} bytes)", frame.name, frame.data.len());
            }
            if !frames.complete {
                anyhow::bail!("transfer incomplete – {} frame(s) received", frames.frames.len());
            }
        }
        Reply::Streaming(receiver) => {
            println!("{}", receiver.output().display());
            let stop = receiver.stop_flag();
            ctrlc::set_handler(move || {
                stop.store(true, std::sync::atomic::Ordering::Relaxed);
            })
            .context("Cannot set Ctrl-C handler")?;
            let stats = receiver.join().context("UDP receiver failed")?;
            println!(
                "{} datagram(s), {:.1} kB",
                stats.datagrams,
                stats.bytes as f64 / 1024.0
            );
        }
    }
    Ok(())
}
