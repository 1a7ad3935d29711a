use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use letschat_client::background::BackgroundTasks;
use letschat_client::conversations::Conversations;
use letschat_client::db::{Db, Profile};
use letschat_client::recv_dispatcher::RecvDispatcher;
use letschat_client::recv_msgs::RecvMsgs;
use letschat_client::reconciler::Reconciler;
use letschat_client::send_pipeline::SendPipeline;
use letschat_client::wire::run_wire_loop;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Terminal chat client message-delivery core.
///
/// Authentication and registration are owned by an external service; this
/// binary only consumes an already-issued `(server_addr, token, user_id)`
/// triple, caching it locally so subsequent runs need no flags at all.
#[derive(Parser, Debug)]
#[command(name = "letschat-client", about = "Letschat message delivery core")]
struct Cli {
    /// Websocket endpoint, e.g. ws://127.0.0.1:8080/ws.
    #[arg(long, env = "SERVER_ADDR")]
    server_addr: Option<String>,

    /// Cached bearer token issued by `POST /tokens/authentication`.
    #[arg(long, env = "TOKEN")]
    token: Option<String>,

    /// This account's user id, as returned by the external auth service.
    #[arg(long, env = "USER_ID")]
    user_id: Option<Uuid>,

    #[arg(long, env = "USER_NAME", default_value = "")]
    user_name: String,

    #[arg(long, env = "USER_EMAIL", default_value = "")]
    user_email: String,

    /// Directory holding the embedded per-account database. Defaults to
    /// the OS data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

const EXIT_CLEAN: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_AUTH_REQUIRED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::from(EXIT_CLEAN),
        Err(AppError::AuthRequired) => {
            warn!("no usable credentials; re-authentication required");
            ExitCode::from(EXIT_AUTH_REQUIRED)
        }
        Err(AppError::Fatal(msg)) => {
            error!(error = %msg, "unrecoverable error");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("re-authentication required")]
    AuthRequired,
    #[error("{0}")]
    Fatal(String),
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Fatal(e.to_string())
    }
}

impl From<letschat_client::db::DbError> for AppError {
    fn from(e: letschat_client::db::DbError) -> Self {
        AppError::Fatal(e.to_string())
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("letschat")
    });
    std::fs::create_dir_all(&data_dir)?;
    let db = Arc::new(Db::open(&data_dir.join("letschat.sqlite3"))?);

    let cached = db.load_profile()?;
    let (server_addr, token, user_id) = match (cli.server_addr, cli.token, cli.user_id) {
        (Some(s), Some(t), Some(u)) => {
            db.save_profile(&Profile {
                server_url: s.clone(),
                token: t.clone(),
                user_id: u,
                name: cli.user_name,
                email: cli.user_email,
            })?;
            (s, t, u)
        }
        _ => match cached {
            Some(p) => (p.server_url, p.token, p.user_id),
            None => return Err(AppError::AuthRequired),
        },
    };

    let conversations = Arc::new(Conversations::new());
    let recv_msgs = Arc::new(RecvMsgs::new());
    conversations.refresh(&db, user_id)?;

    let background = BackgroundTasks::new();
    let signal_tx = background.shutdown_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_tx.send(true);
        }
    });

    let mut shutdown = background.shutdown_receiver();
    while !*shutdown.borrow() {
        let result = run_session(
            &server_addr,
            &token,
            user_id,
            db.clone(),
            conversations.clone(),
            recv_msgs.clone(),
            background.shutdown_receiver(),
        )
        .await;
        match result {
            Ok(()) => info!("session ended cleanly"),
            Err(e) => warn!(error = %e, "session ended, retrying"),
        }
        if *shutdown.borrow() {
            break;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
    background.cancel().await;
    Ok(())
}

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Connects once, runs the wire loop and its dependent tasks to
/// completion, and reconciles on the way up. Returns once the connection
/// drops (or shutdown fires), so the caller can reconnect.
async fn run_session(
    server_addr: &str,
    token: &str,
    current_user: Uuid,
    db: Arc<Db>,
    conversations: Arc<Conversations>,
    recv_msgs: Arc<RecvMsgs>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<(), String> {
    let mut request = server_addr
        .into_client_request()
        .map_err(|e| e.to_string())?;
    let header_value = format!("Bearer {token}")
        .parse()
        .map_err(|_| "invalid token header value".to_owned())?;
    request.headers_mut().insert("Authorization", header_value);

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| e.to_string())?;
    info!(%current_user, "connected");

    // `outbound` carries only the frames `SendPipeline` sends, one ack per
    // frame on `ack_rx`. Everything else that wants to put a frame on the
    // wire without waiting on an outcome — the dispatcher's synthetic
    // delivery acks, the reconciler's read receipts — goes out through
    // `fire_and_forget`, which the wire loop writes without touching
    // `ack_tx` at all. Keeping these separate is what stops a received
    // message from ever being mistaken for a send's own ack.
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (fire_and_forget_tx, fire_and_forget_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (ack_tx, ack_rx) = mpsc::channel(4);

    let session_id = Uuid::new_v4().to_string();
    let wire_task = tokio::spawn(run_wire_loop(
        ws_stream,
        session_id,
        outbound_rx,
        fire_and_forget_rx,
        inbound_tx,
        ack_tx,
        shutdown_rx,
    ));

    let dispatcher = RecvDispatcher::new(
        db.clone(),
        conversations.clone(),
        recv_msgs.clone(),
        fire_and_forget_tx.clone(),
        current_user,
    );
    let dispatcher_task = tokio::spawn(async move {
        dispatcher.run(inbound_rx).await;
    });

    let send_pipeline = Arc::new(SendPipeline::new(
        outbound_tx.clone(),
        ack_rx,
        db.clone(),
        conversations.clone(),
        recv_msgs,
    ));
    let reconciler = Reconciler::new(db.clone(), conversations.clone(), send_pipeline, current_user);
    if let Err(e) = reconciler.reconcile_outbound().await {
        warn!(error = %e, "reconcile_outbound failed after reconnect");
    }

    let wire_result = wire_task.await.map_err(|e| e.to_string())?;
    drop(outbound_tx);
    drop(fire_and_forget_tx);
    let _ = dispatcher_task.await;
    wire_result.map_err(|e| e.to_string())
}
