//! Terminal-Frontend für LanLink
//!
//! Zeilen mit `/` sind Befehle, alles andere geht als Chat-Nachricht raus.

use anyhow::Context;
use lanlink::call_engine::{CallEvent, CallType};
use lanlink::chat::ExportFormat;
use lanlink::config::AppConfig;
use lanlink::{recv_event, App, UiEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
Commands:
  /call audio|video   start a call
  /accept             accept the incoming call
  /decline            decline the incoming call
  /hangup             end the current call
  /mute               toggle microphone
  /video              toggle camera
  /screen [stop]      start or stop screen sharing
  /discover           announce this node
  /peer <ip> [port]   add a peer to the node
  /clear              clear chat history
  /export [html]      export chat history
  /attach <path>      attach a file
  /stop               emergency stop
  /quit               exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging initialisieren
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lanlink=info,webrtc=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Initializing LanLink...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("load config")?;

    let app = App::new(config).context("create app")?;
    let ui_rx = app.subscribe();
    tokio::spawn(render(ui_rx));

    app.start().context("start app")?;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !handle_line(&app, line.trim()).await {
            break;
        }
    }

    app.shutdown();
    tracing::info!("LanLink stopped");
    Ok(())
}

/// Führt eine Eingabezeile aus; `false` beendet das Programm
async fn handle_line(app: &Arc<App>, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    if !line.starts_with('/') {
        match app.send_chat(line) {
            Ok(true) => {}
            Ok(false) => eprintln!("! not connected, message not sent"),
            Err(e) => eprintln!("! {}", e),
        }
        return true;
    }

    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let arg = parts.next();

    let result = match command {
        "/call" => match arg.unwrap_or("audio").parse::<CallType>() {
            Ok(call_type) => app.start_call(call_type),
            Err(e) => {
                eprintln!("! {}", e);
                Ok(())
            }
        },
        "/accept" => app.accept_call().await,
        "/decline" => app.decline_call(),
        "/hangup" => {
            app.end_call();
            Ok(())
        }
        "/mute" => app.toggle_mute().map(|_| ()),
        "/video" => app.toggle_video().map(|_| ()),
        "/screen" if arg == Some("stop") => app.stop_screen_share().await,
        "/screen" => app.share_screen().await,
        "/discover" => app.discover_peers(),
        "/peer" => match arg {
            Some(ip) => {
                let port = parts.next().and_then(|p| p.parse::<u16>().ok());
                app.add_peer(ip, port).await.map(|_| ())
            }
            None => {
                eprintln!("! usage: /peer <ip> [port]");
                Ok(())
            }
        },
        "/clear" => {
            app.clear_chat();
            Ok(())
        }
        "/export" => {
            let format = if arg == Some("html") {
                ExportFormat::Html
            } else {
                ExportFormat::Text
            };
            app.export_chat(format).map(|path| {
                println!("* exported to {}", path.display());
            })
        }
        "/attach" => match arg {
            Some(_) => {
                let path = line["/attach".len()..].trim();
                app.attach_file(std::path::Path::new(path))
            }
            None => {
                eprintln!("! usage: /attach <path>");
                Ok(())
            }
        },
        "/stop" => {
            app.emergency_stop();
            Ok(())
        }
        "/quit" => return false,
        "/help" => {
            println!("{}", HELP);
            Ok(())
        }
        other => {
            eprintln!("! unknown command {}, try /help", other);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("! {}", e);
    }
    true
}

/// Gibt UI-Events auf stdout aus
async fn render(mut rx: tokio::sync::broadcast::Receiver<UiEvent>) {
    while let Some(event) = recv_event(&mut rx).await {
        match event {
            UiEvent::Status(status) => println!("* node status: {}", status),
            UiEvent::Chat(entry) => println!("{}", entry.render_text()),
            UiEvent::ChatCleared(entry) => {
                // ANSI: Bildschirm leeren
                print!("\x1b[2J\x1b[H");
                println!("{}", entry.render_text());
            }
            UiEvent::Call(CallEvent::IncomingCall(call)) => {
                println!(
                    "* incoming {} call from {} (/accept or /decline)",
                    call.call_type, call.caller
                );
            }
            UiEvent::Call(CallEvent::MediaPanel { visible }) => {
                println!("* media panel {}", if visible { "open" } else { "closed" });
            }
            UiEvent::Call(CallEvent::RemoteTrack(track)) => {
                println!("* receiving {:?} track ({})", track.kind, track.mime_type);
            }
            UiEvent::Call(_) => {}
        }
    }
}
