use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(about = "Management CLI for the failover proxy", long_about = None)]
struct Cli {
    /// Base URL of the proxy
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Management API key, if the proxy requires one
    #[arg(short, long)]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Circuit breaker and rate-limit state per backend
    Status,
    /// Configured backends (tokens masked)
    Backends,
    /// Proxy health
    Health,
    /// Enable a backend and reset its circuit
    Enable { name: String },
    /// Disable a backend
    Disable { name: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let mut headers = HeaderMap::new();
    if let Some(key) = &cli.key {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}"))?);
    }

    let request = match &cli.command {
        Commands::Status => client.get(format!("{base}/backends/status")),
        Commands::Backends => client.get(format!("{base}/backends")),
        Commands::Health => client.get(format!("{base}/health")),
        Commands::Enable { name } => client.post(format!("{base}/backend/{name}/enable")),
        Commands::Disable { name } => client.post(format!("{base}/backend/{name}/disable")),
    };

    let res = request.headers(headers).send().await?;
    let ok = print_response(res).await?;
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<bool, Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    let rendered = match serde_json::from_str::<Value>(&text) {
        Ok(json) => serde_json::to_string_pretty(&json)?,
        Err(_) => text,
    };

    if status.is_success() {
        println!("{rendered}");
        Ok(true)
    } else {
        eprintln!("Error: management API returned status {status}");
        eprintln!("{rendered}");
        Ok(false)
    }
}
