use crate::config::ServerConfig;
use crate::server;
use anyhow::Result;
use clap::Args;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Args)]
pub struct ServeArgs {
    /// JSON configuration file (defaults to <config_dir>/livedraw/server.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Directory of static files served at /
    #[arg(long, env = "LIVEDRAW_PUBLIC_DIR")]
    public_dir: Option<PathBuf>,

    /// Samples drawn per round
    #[arg(long)]
    samples: Option<u32>,

    /// Seconds before the final that the preview is published
    #[arg(long)]
    preview_offset: Option<u32>,

    /// Seconds between WebSocket heartbeats
    #[arg(long)]
    heartbeat_secs: Option<u64>,
}

impl ServeArgs {
    fn apply(self, mut config: ServerConfig, token: Option<String>) -> ServerConfig {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(dir) = self.public_dir {
            config.public_dir = dir;
        }
        if let Some(samples) = self.samples {
            config.schedule.samples_planned = samples;
        }
        if let Some(offset) = self.preview_offset {
            config.schedule.preview_offset_secs = offset;
        }
        if let Some(secs) = self.heartbeat_secs {
            config.heartbeat_secs = secs;
        }
        if let Some(token) = token {
            config.admin_token = token;
        }
        config
    }
}

pub async fn handle_serve_command(args: ServeArgs, token: Option<String>) -> Result<()> {
    let config = ServerConfig::load(args.config.as_deref())?;
    let config = args.apply(config, token);

    tracing::info!(
        "Schedule: {} samples per round, preview {}s before final",
        config.schedule.samples_planned,
        config.schedule.preview_offset_secs
    );

    server::run(config).await
}
