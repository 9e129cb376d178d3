use ffbatch::adapters::http::{router, ApiState};
use ffbatch::adapters::local::board::BoardEvent;
use ffbatch::adapters::local::{LocalFiles, MessageBoard};
use ffbatch::adapters::{FfmpegToolkit, RetryingDownloader};
use ffbatch::application::{BatchController, JobRunner};
use ffbatch::AppConfig;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ffbatch=info")),
        )
        .init();

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(config.staging_dir())
        .await
        .expect("Failed to create work directory");

    let board = Arc::new(MessageBoard::new(config.max_message_len));
    let runner = JobRunner::new(
        Arc::new(RetryingDownloader::new(LocalFiles, config.retry_policy())),
        Arc::new(FfmpegToolkit::new(
            config.ffmpeg_path.clone(),
            config.ffprobe_path.clone(),
        )),
        board.clone(),
        config.runner_settings(),
    );
    let controller = Arc::new(BatchController::new(
        Arc::new(runner),
        board.clone(),
        config.controller_settings(),
    ));

    tokio::spawn(echo_messages(board.clone()));

    let app = router(ApiState {
        controller,
        board,
        staging_dir: config.staging_dir(),
    });

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port))
        .await
        .expect("Failed to bind TCP listener");
    info!(
        addr = %config.addr,
        port = %config.port,
        max_concurrent = config.max_concurrent,
        work_dir = %config.work_dir.display(),
        "Listening"
    );
    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}

// Mirror every posted message to the log so a headless run can be followed.
async fn echo_messages(board: Arc<MessageBoard>) {
    let mut events = board.subscribe();
    loop {
        match events.recv().await {
            Ok(BoardEvent::Posted { session, id, text }) => {
                info!(session = %session, message = id.0, "{}", text)
            }
            Ok(BoardEvent::Edited { session, id, text }) => {
                debug!(session = %session, message = id.0, "{}", text)
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Message echo fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
