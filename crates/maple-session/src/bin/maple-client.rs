use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use maple_media::{NullSink, PlaybackSurface, StreamSurface};
use maple_session::config::{
    DEFAULT_HLS_BASE_URL, DEFAULT_PLAYLIST_PATH, DEFAULT_SIGNALING_URL, DEFAULT_STUN_SERVER,
};
use maple_session::{
    AdaptiveConfig, AdaptiveSession, HlsEngine, NegotiatedSession, RetryConfig, RetryMode,
    SessionConfig, WebRtcConnector, WsConnector,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "maple-client", about = "Play a live video session and keep it alive")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Negotiate a WebRTC peer connection over WebSocket signaling
    Webrtc {
        #[arg(long, env = "MAPLE_SIGNALING_URL", default_value = DEFAULT_SIGNALING_URL)]
        signaling_url: String,
        /// STUN/TURN server URL (repeatable)
        #[arg(long = "ice-server", env = "MAPLE_ICE_SERVERS", value_delimiter = ',', default_value = DEFAULT_STUN_SERVER)]
        ice_servers: Vec<String>,
        #[command(flatten)]
        retry: RetryArgs,
    },
    /// Pull an HLS playlist over HTTP
    Hls {
        #[arg(long, env = "MAPLE_HLS_BASE_URL", default_value = DEFAULT_HLS_BASE_URL)]
        base_url: String,
        #[arg(long, env = "MAPLE_PLAYLIST_PATH", default_value = DEFAULT_PLAYLIST_PATH)]
        playlist: String,
        /// Report live playlists with their window duration instead of an unbounded one
        #[arg(long, default_value_t = false)]
        finite_live_duration: bool,
        /// HTTP request timeout in milliseconds
        #[arg(long, env = "MAPLE_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
        request_timeout_ms: u64,
        #[command(flatten)]
        retry: RetryArgs,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum RetryKind {
    Fixed,
    Exponential,
}

#[derive(Args, Debug)]
struct RetryArgs {
    #[arg(long, env = "MAPLE_RETRY_MODE", value_enum, default_value = "fixed")]
    retry_mode: RetryKind,
    /// Delay before each recovery attempt, in milliseconds
    #[arg(long, env = "MAPLE_RETRY_DELAY_MS", default_value_t = 1000)]
    retry_delay_ms: u64,
    /// Upper bound for exponential delays, in milliseconds
    #[arg(long, env = "MAPLE_RETRY_MAX_DELAY_MS", default_value_t = 30_000)]
    retry_max_delay_ms: u64,
    /// Give up after this many consecutive attempts (unbounded when unset)
    #[arg(long, env = "MAPLE_RETRY_MAX_ATTEMPTS")]
    retry_max_attempts: Option<u32>,
}

impl RetryArgs {
    fn into_config(self) -> RetryConfig {
        RetryConfig {
            mode: match self.retry_mode {
                RetryKind::Fixed => RetryMode::Fixed,
                RetryKind::Exponential => RetryMode::Exponential,
            },
            delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            max_attempts: self.retry_max_attempts,
        }
    }
}

fn main() -> anyhow::Result<()> {
    maple_common::init_tracing();
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli.mode))
}

async fn run(mode: Mode) -> anyhow::Result<()> {
    let surface = Arc::new(StreamSurface::new(NullSink::new()));

    match mode {
        Mode::Webrtc {
            signaling_url,
            ice_servers,
            retry,
        } => {
            let config = SessionConfig {
                signaling_url,
                ice_servers: ice_servers.clone(),
                retry: retry.into_config(),
            };
            info!("starting WebRTC session via {}", config.signaling_url);
            let session = NegotiatedSession::start(
                config,
                Arc::new(WsConnector),
                Arc::new(WebRtcConnector::new(ice_servers)),
                surface.clone() as Arc<dyn PlaybackSurface>,
            )?;

            let mut status = session.subscribe_status();
            tokio::select! {
                _ = async {
                    while status.changed().await.is_ok() {
                        info!("status: {}", *status.borrow_and_update());
                    }
                } => {}
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
            }
            session.disconnect().await?;
        }
        Mode::Hls {
            base_url,
            playlist,
            finite_live_duration,
            request_timeout_ms,
            retry,
        } => {
            let config = AdaptiveConfig {
                base_url,
                playlist_path: playlist,
                live_duration_infinity: !finite_live_duration,
                request_timeout: Duration::from_millis(request_timeout_ms),
                retry: retry.into_config(),
            };
            let engine = HlsEngine::new(&config)?;
            info!("starting HLS session at {}{}", config.base_url, config.playlist_path);
            let session = AdaptiveSession::start(
                Box::new(engine),
                surface.clone() as Arc<dyn PlaybackSurface>,
                config,
            );

            let mut status = session.subscribe_status();
            tokio::select! {
                _ = async {
                    while status.changed().await.is_ok() {
                        info!("status: {}", *status.borrow_and_update());
                    }
                } => {}
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
            }
            session.stop().await?;
        }
    }

    info!("rendered {} chunks", surface.frames_rendered());
    Ok(())
}
