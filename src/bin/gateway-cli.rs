use clap::{Parser, Subcommand};
use reqwest::header::COOKIE;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Command line client for the session gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Session token from a previous `login`.
    #[arg(short, long, env = "GATEWAY_TOKEN")]
    token: Option<String>,

    /// Field name carrying the session id.
    #[arg(long, default_value = "token")]
    token_name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and print the issued token
    Login { username: String },
    /// Show the signed-in user
    Whoami,
    /// Show the session data
    Session,
    /// Merge KEY=VALUE pairs into the session
    Set { pairs: Vec<String> },
    /// Bump and show the visit counter
    Visits,
    /// Destroy the session
    Logout,
    /// Check liveness
    Health,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let url = |path: &str| format!("{}{}", cli.url.trim_end_matches('/'), path);
    let with_token = |req: reqwest::RequestBuilder| match &cli.token {
        Some(token) => req.header(COOKIE, format!("{}={}", cli.token_name, token)),
        None => req,
    };

    let res = match cli.command {
        Commands::Login { username } => {
            client
                .post(url("/api/session"))
                .json(&json!({ "username": username }))
                .send()
                .await?
        }
        Commands::Whoami => with_token(client.get(url("/api/profile"))).send().await?,
        Commands::Session => with_token(client.get(url("/api/session"))).send().await?,
        Commands::Set { pairs } => {
            let mut data = serde_json::Map::new();
            for pair in pairs {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("expected KEY=VALUE, got '{pair}'"))?;
                let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
                data.insert(key.to_string(), value);
            }
            with_token(client.put(url("/api/session")))
                .json(&json!({ "data": data }))
                .send()
                .await?
        }
        Commands::Visits => with_token(client.get(url("/api/visits"))).send().await?,
        Commands::Logout => with_token(client.delete(url("/api/session"))).send().await?,
        Commands::Health => {
            let res = client.get(url("/health")).send().await?;
            println!("{} {}", res.status(), res.text().await?);
            return Ok(());
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    let Ok(envelope) = serde_json::from_str::<Value>(&text) else {
        eprintln!("Error: gateway returned status {status}");
        eprintln!("Response: {text}");
        return Ok(());
    };

    if !status.is_success() || envelope["code"] != 0 {
        eprintln!(
            "Error: status {}, code {}: {}",
            status,
            envelope["code"],
            envelope["message"].as_str().unwrap_or_default()
        );
    }
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}
