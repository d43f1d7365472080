use std::{collections::HashMap, fs, sync::Arc};

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use client_core::{ClientConfig, HttpTransport, RoomClient, Session, Transport};
use shared::domain::{DeviceId, RoomId, UserId};

#[derive(Debug)]
struct Settings {
    homeserver: String,
    user_id: String,
    device_id: String,
    access_token: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            homeserver: "http://127.0.0.1:8008".into(),
            user_id: "@tools:localhost".into(),
            device_id: "TOOLSDEVICE".into(),
            access_token: String::new(),
        }
    }
}

fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("homeserver") {
                settings.homeserver = v.clone();
            }
            if let Some(v) = file_cfg.get("user_id") {
                settings.user_id = v.clone();
            }
            if let Some(v) = file_cfg.get("device_id") {
                settings.device_id = v.clone();
            }
            if let Some(v) = file_cfg.get("access_token") {
                settings.access_token = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("HOMESERVER") {
        settings.homeserver = v;
    }
    if let Ok(v) = std::env::var("APP__HOMESERVER") {
        settings.homeserver = v;
    }

    if let Ok(v) = std::env::var("USER_ID") {
        settings.user_id = v;
    }
    if let Ok(v) = std::env::var("APP__USER_ID") {
        settings.user_id = v;
    }

    if let Ok(v) = std::env::var("DEVICE_ID") {
        settings.device_id = v;
    }

    if let Ok(v) = std::env::var("ACCESS_TOKEN") {
        settings.access_token = v;
    }
    if let Ok(v) = std::env::var("APP__ACCESS_TOKEN") {
        settings.access_token = v;
    }

    settings
}

#[derive(Parser, Debug)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and print a room's timeline.
    Timeline {
        room_id: String,
        /// Print events as fetched, without decryption.
        #[arg(long)]
        raw: bool,
    },
    /// Send a text message into a room.
    Send {
        room_id: String,
        body: String,
        #[arg(long)]
        skip_encryption_setup: bool,
    },
    /// Verify the session against the homeserver.
    Status,
}

fn session_from(settings: &Settings) -> Result<Session> {
    if settings.access_token.is_empty() {
        bail!("no access token configured; set ACCESS_TOKEN or access_token in client.toml");
    }
    Ok(Session {
        homeserver: settings.homeserver.clone(),
        user_id: UserId::from(settings.user_id.as_str()),
        device_id: DeviceId::from(settings.device_id.as_str()),
        access_token: settings.access_token.clone(),
    })
}

fn render_timestamp(origin_server_ts: i64) -> String {
    DateTime::from_timestamp_millis(origin_server_ts)
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| origin_server_ts.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();
    let settings = load_settings();
    let session = session_from(&settings)?;
    let config = ClientConfig::default();
    let transport = Arc::new(
        HttpTransport::new(&session.homeserver, config.http_timeout)
            .with_context(|| format!("invalid homeserver '{}'", session.homeserver))?,
    );

    match cli.command {
        Command::Timeline { room_id, raw } => {
            // No crypto backend is wired into the CLI, so encrypted events
            // come back as ciphertext either way.
            let client = RoomClient::new(transport, session);
            let timeline = client.room_messages(&RoomId::from(room_id.as_str()), raw).await;
            if timeline.is_empty() {
                println!("no events for {room_id}");
                return Ok(());
            }
            for event in &timeline {
                let body = event
                    .content
                    .get("body")
                    .and_then(|body| body.as_str())
                    .unwrap_or("<no body>");
                println!(
                    "{} {} <{}> {}",
                    render_timestamp(event.origin_server_ts),
                    event.event_id,
                    event.sender,
                    body
                );
            }
        }
        Command::Send {
            room_id,
            body,
            skip_encryption_setup,
        } => {
            let client = RoomClient::new(transport, session);
            let delivered = client
                .send_message(&RoomId::from(room_id.as_str()), &body, skip_encryption_setup)
                .await;
            if !delivered {
                bail!("message was not sent to {room_id}");
            }
            println!("sent to {room_id}");
        }
        Command::Status => {
            let response = transport
                .get("/_matrix/client/v3/account/whoami", &[], &session.access_token)
                .await
                .context("whoami request failed")?;
            if !response.is_success() {
                match response.api_error() {
                    Some(api_error) => bail!("session rejected: {api_error}"),
                    None => bail!("whoami returned status {}", response.status),
                }
            }
            let user_id = response.body["user_id"].as_str().unwrap_or("<unknown>");
            println!("logged in as {user_id} on {}", session.homeserver);
            println!("device: {}", session.device_id);
        }
    }

    Ok(())
}
