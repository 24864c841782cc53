use desktop_api_client::config::Config;
use desktop_api_client::protocol::{Command, Verb};
use desktop_api_client::transport;
use desktop_api_client::{Client, ClientEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Duration;

/// How long one-shot commands keep listening for replies before exiting.
const REPLY_GRACE: Duration = Duration::from_millis(1500);

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, rest) = match args.split_first() {
        Some((command, rest)) => (command.as_str(), rest),
        None => ("repl", &[][..]),
    };

    match command {
        "config-init" => handle_config_init(),
        "probe" => handle_probe(&config).await,
        "call" => handle_call(&config, rest).await,
        "send" => handle_send(&config, rest).await,
        "repl" => handle_repl(&config).await,
        other => Err(format!(
            "unknown command {other:?}; expected config-init, probe, call, send or repl"
        )
        .into()),
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn start_client(config: &Config) -> Result<Client, Box<dyn std::error::Error>> {
    let transport = transport::spawn_native(&config.transport)?;
    let client = Client::builder(&config.client).build(transport)?;
    client.on_event(log_event);

    let wait = Duration::from_secs(config.client.connect_wait_secs);
    tracing::info!(wait_secs = wait.as_secs(), "waiting for peer to attach");
    tokio::time::timeout(wait, client.connect())
        .await
        .map_err(|_| format!("peer did not attach within {}s", wait.as_secs()))??;
    tracing::info!(client = %client.id(), "attached");
    Ok(client)
}

fn log_event(event: &ClientEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::info!(event = %json, "event"),
        Err(err) => tracing::warn!(error = %err, "failed to serialize event"),
    }
}

async fn handle_probe(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = start_client(config).await?;
    client
        .send(Command::new(Verb::Get).arg("SKYPEVERSION"))
        .await?;
    client
        .send(Command::new(Verb::Get).arg("CURRENTUSERHANDLE"))
        .await?;
    client.send(Command::new(Verb::Get).arg("CONNSTATUS")).await?;
    tokio::time::sleep(REPLY_GRACE).await;

    let info = client.peer_info().await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    client.shutdown().await?;
    Ok(())
}

async fn handle_call(config: &Config, targets: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if targets.is_empty() {
        return Err("usage: call <target> [<target>...]".into());
    }
    let client = start_client(config).await?;
    client.initiate_call(targets.to_vec()).await?;
    tracing::info!(targets = ?targets, "call placed; press ctrl-c to exit");

    tokio::signal::ctrl_c().await?;
    client.shutdown().await?;
    Ok(())
}

async fn handle_send(config: &Config, words: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let text = words.join(" ");
    if text.trim().is_empty() {
        return Err("usage: send <command...>".into());
    }
    let client = start_client(config).await?;
    client.send_raw(text).await?;
    tokio::time::sleep(REPLY_GRACE).await;
    client.shutdown().await?;
    Ok(())
}

async fn handle_repl(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = start_client(config).await?;
    println!("attached; type commands, :calls, :peer, :status, :call <targets...> or :quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(err) = handle_repl_line(&client, line).await {
            if err.is::<Quit>() {
                break;
            }
            tracing::warn!(error = %err, input = %line, "command failed");
        }
    }

    client.shutdown().await?;
    Ok(())
}

#[derive(Debug)]
struct Quit;

impl std::fmt::Display for Quit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("quit")
    }
}

impl std::error::Error for Quit {}

async fn handle_repl_line(client: &Client, line: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    match head {
        ":quit" | ":q" => Err(Box::new(Quit)),
        ":status" => {
            println!("{:?}", client.status().await?);
            Ok(())
        }
        ":peer" => {
            println!("{}", serde_json::to_string_pretty(&client.peer_info().await?)?);
            Ok(())
        }
        ":calls" => {
            println!("{}", serde_json::to_string_pretty(&client.calls().await?)?);
            Ok(())
        }
        ":call" => {
            let targets = rest.split_whitespace().map(str::to_string).collect();
            client.initiate_call(targets).await?;
            Ok(())
        }
        _ => {
            client.send_raw(line).await?;
            Ok(())
        }
    }
}
