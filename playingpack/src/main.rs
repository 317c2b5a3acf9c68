// Copyright 2026 The Playingpack Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use playingpack::broker::SessionBroker;
use playingpack::cache::CacheStore;
use playingpack::engine::AppState;
use playingpack::mock::MockGenerator;
use playingpack::proxy;
use playingpack::settings::{CacheMode, Settings, SharedSettings};
use playingpack::upstream::ReqwestUpstreamClient;

use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "playingpack",
    about = "OpenAI-compatible debugging proxy with record/replay and operator interception"
)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 4141, env = "PLAYINGPACK_PORT")]
    port: u16,

    /// Upstream chat-completions endpoint
    #[arg(long, default_value = "https://api.openai.com", env = "PLAYINGPACK_UPSTREAM")]
    upstream: String,

    /// Directory holding recorded responses
    #[arg(long, default_value = "recordings", env = "PLAYINGPACK_CACHE_DIR")]
    cache_dir: String,

    /// Cache mode
    #[arg(long, value_enum, default_value = "read-write", env = "PLAYINGPACK_CACHE")]
    cache: CacheMode,

    /// Start with the operator decision points disabled
    #[arg(long, env = "PLAYINGPACK_NO_INTERVENE")]
    no_intervene: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = Settings {
        cache: cli.cache,
        intervene: !cli.no_intervene,
        upstream: cli.upstream,
    };
    tracing::info!(
        cache = ?settings.cache,
        intervene = settings.intervene,
        upstream = %settings.upstream,
        cache_dir = %cli.cache_dir,
        "playingpack starting"
    );

    let broker = Arc::new(SessionBroker::new());
    let _reaper = broker.spawn_reaper();

    let state = AppState {
        broker,
        cache: CacheStore::new(cli.cache_dir),
        upstream: Arc::new(ReqwestUpstreamClient::default()),
        settings: SharedSettings::new(settings),
        mock: MockGenerator::default(),
    };

    let app = proxy::build_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    tracing::info!(%addr, "playingpack listening");

    axum::serve(listener, app)
        .await
        .expect("server error");
}
