use clap::Parser;

use ccprobe_core::chain::{ChainRunner, STEP_READ_DELIVERY};
use ccprobe_core::cli::Cli;
use ccprobe_core::discovery::DiscoveredEndpoint;
use ccprobe_core::telemetry;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    telemetry::init(&cli.logging.to_config())?;

    let discovery = cli.discovery.to_config()?;
    let chain = cli.chain_config()?;
    let runner = ChainRunner::new(chain, discovery)?;

    let mut session: Option<DiscoveredEndpoint> = None;
    let outcome = runner.run(&mut session).await;

    for entry in &outcome.log {
        println!("{}", entry.to_json());
    }

    if let Some(endpoint) = &session {
        eprintln!(
            "📡 agent: {} (proto {}, port {})",
            endpoint.base_url, endpoint.protocol, endpoint.port
        );
    } else {
        eprintln!("⚠️  no agent answered; see the log above for each candidate's fate");
    }

    if let Some(decrypted) = outcome.step_response(STEP_READ_DELIVERY) {
        if let Some(card) = decrypted.pointer("/data/card") {
            println!("💳 card:\n{}", serde_json::to_string_pretty(card)?);
        }
        if let Some(photo) = decrypted.pointer("/data/photo").and_then(|p| p.as_str()) {
            eprintln!("🖼  photo payload: {} chars", photo.len());
        }
    }

    if let Some(error) = outcome.error {
        return Err(error.into());
    }
    Ok(())
}
