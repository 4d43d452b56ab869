use std::sync::Arc;

use log::{error, info, warn};
use room_chat::{
    ConnectionState, DisplayMessage, HttpHistoryApi, MemoryCredentials, RoomSession, SessionConfig,
    WsConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const SHOWN_MESSAGES: usize = 15;

fn usage() -> ! {
    eprintln!("usage: room_chat <room-id> [config.json]");
    eprintln!("token is read from ROOM_CHAT_TOKEN");
    std::process::exit(2);
}

fn render(messages: &[DisplayMessage]) {
    // Oldest at the top, like the room screen.
    for message in messages.iter().take(SHOWN_MESSAGES).rev() {
        let text: String = message
            .segments()
            .into_iter()
            .map(|(fragment, emphasized)| {
                if emphasized {
                    format!("[{fragment}]")
                } else {
                    fragment.to_string()
                }
            })
            .collect();
        println!(
            "#{:<6} {} {}: {}",
            message.id,
            message.sent_at.format("%H:%M"),
            message.sender_display_name,
            text
        );
    }
}

async fn handle_line(session: &RoomSession, line: &str) {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    let result = match command {
        "/older" => session.load_older().await.map(|o| format!("{o:?}")),
        "/newer" => session.load_newer().await.map(|o| format!("{o:?}")),
        "/search" => session.search(arg).await.map(|id| format!("match {id:?}")),
        "/prev" => session.step_backward().await.map(|id| format!("match {id:?}")),
        "/next" => session.step_forward().await.map(|id| format!("match {id:?}")),
        "/close" => session.close_search().await.map(|o| format!("{o:?}")),
        "/translate" => session
            .set_translation(arg.trim() == "on")
            .await
            .map(|o| format!("{o:?}")),
        "/delete" => {
            let Ok(id) = arg.trim().parse() else {
                println!("/delete needs a message id");
                return;
            };
            // Typing the command is the confirmation.
            let request = session.prepare_delete(id);
            match session.delete_message(request.confirm()).await {
                Ok(()) => println!("delete requested"),
                Err(e) => println!("delete failed: {e}"),
            }
            return;
        }
        _ => {
            if let Err(e) = session.send_message(line).await {
                println!("not sent ({e}), message kept: {line}");
            }
            return;
        }
    };
    match result {
        Ok(summary) => println!("{summary}"),
        Err(e) => println!("request failed: {e}"),
    }
    render(&session.display().await);
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let Some(room_id) = args.next().and_then(|a| a.parse().ok()) else {
        usage();
    };
    let config = match args.next() {
        Some(path) => SessionConfig::from_file(path),
        None => Ok(SessionConfig::default()),
    }
    .and_then(SessionConfig::with_env);
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    let Ok(token) = std::env::var("ROOM_CHAT_TOKEN") else {
        usage();
    };

    let credentials = Arc::new(MemoryCredentials::new(token));
    let history = match HttpHistoryApi::new(&config.api_url, credentials.clone()) {
        Ok(history) => Arc::new(history),
        Err(e) => {
            error!("Failed to build history client: {e}");
            std::process::exit(1);
        }
    };
    let connector = Arc::new(WsConnector::new(config.ws_url.clone()));
    let session = RoomSession::open(room_id, &config, connector, credentials, history);

    if let Err(e) = session.load_initial().await {
        warn!("Initial history load failed: {e}");
    }
    render(&session.display().await);

    let mut state = session.watch_connection();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            if current == ConnectionState::Connected {
                info!("Live");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        if line == "/quit" {
            break;
        }
        if !line.is_empty() {
            handle_line(&session, line).await;
        }
    }

    session.close().await;
    if let Some(failure) = session.failure().await {
        error!("Session ended with: {failure}");
    }
}
