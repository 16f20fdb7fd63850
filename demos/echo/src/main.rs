use async_trait::async_trait;
use tether::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Plugin
// ---------------------------------------------------------------------------

/// Answers every `ping` with a `pong` carrying the same arguments.
struct Echo {
    conn: ActivityConnection<WebSocketSocket>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Plugin for Echo {
    async fn plugged(&mut self) {
        let mut pings = self.conn.subscribe("ping").await;
        let conn = self.conn.clone();
        self.task = Some(tokio::spawn(async move {
            while let Some(body) = pings.recv().await {
                if let Err(e) = conn.send("pong", body).await {
                    tracing::debug!(activity = %conn.activity_id(), error = %e, "pong not sent");
                    break;
                }
            }
        }));
    }

    async fn unplugged(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Operator console
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Command {
    List,
    Allow(String),
    Deny(String),
    Passport(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let command = match (words.next()?, words.next()) {
        ("list", None) => Command::List,
        ("allow", Some(id)) => Command::Allow(id.to_string()),
        ("deny", Some(id)) => Command::Deny(id.to_string()),
        ("passport", Some(secret)) => Command::Passport(secret.to_string()),
        _ => return None,
    };
    words.next().is_none().then_some(command)
}

async fn run_console(connections: Connections<WebSocketSocket>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(command) = parse_command(&line) else {
            eprintln!("commands: list | allow <id> | deny <id> | passport <secret>");
            continue;
        };
        match command {
            Command::List => {
                for connection in connections.list().await {
                    eprintln!(
                        "{} connected={} authenticated={}",
                        connection.id(),
                        connection.is_connected(),
                        connection.is_authenticated()
                    );
                }
            }
            Command::Allow(id) => confirm(&connections, &id, true).await,
            Command::Deny(id) => confirm(&connections, &id, false).await,
            Command::Passport(secret) => match connections.set_passport(&secret).await {
                Ok(()) => eprintln!("passport changed"),
                Err(e) => eprintln!("passport not changed: {e}"),
            },
        }
    }
}

async fn confirm(connections: &Connections<WebSocketSocket>, id: &str, allow: bool) {
    let Some(connection) = connections.find(&ConnectionId::from(id)).await else {
        eprintln!("no connection {id}");
        return;
    };
    if let Err(e) = connection.confirm(allow).await {
        eprintln!("{id}: {e}");
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), TetherError> {
    tether::init_tracing();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let server = TetherServer::builder()
        .bind(&addr)
        .settings_path("settings.json")
        .plugin("echo", |conn| Echo { conn, task: None })
        .build()
        .await?;

    let local = server.local_addr()?;
    tracing::info!(addr = %local, "echo server ready; type `list` or `allow <id>`");
    tokio::spawn(run_console(server.connections().clone()));
    server.run().await
}
