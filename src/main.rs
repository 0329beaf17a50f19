use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

mod auth;
mod cli;
mod error;
mod genomics;
mod pipeline;

use auth::{Authorizer, LocalServerReceiver, OAuthCodeExchange, PromptReceiver, TokenCache};
use cli::Args;
use genomics::GenomicsClient;

#[tokio::main]
async fn main() {
    // A .env file is optional; real environment variables take precedence.
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(args).await {
        error!(error = %err, "run failed");
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}

async fn run(args: Args) -> error::Result<()> {
    let authorizer = Authorizer::new(args.credentials(), TokenCache::new(&args.token_cache));
    let exchange = OAuthCodeExchange::new(args.credentials()).with_token_url(&args.token_url);

    let credential = if args.local_server {
        let mut receiver =
            LocalServerReceiver::new(args.redirect_port).open_browser(!args.no_browser);
        authorizer.authorize(&mut receiver, &exchange).await?
    } else {
        let mut receiver = PromptReceiver::stdio();
        authorizer.authorize(&mut receiver, &exchange).await?
    };

    let api = GenomicsClient::new(&args.api_root, credential)?;
    debug!(api_root = %api.api_root(), "genomics client ready");
    pipeline::run(
        &api,
        &args.query(),
        &mut std::io::stdout(),
        &mut std::io::stderr(),
    )
    .await
}
