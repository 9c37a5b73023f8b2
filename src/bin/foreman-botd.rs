use clap::Parser;
use foreman_bot::daemon;
use foreman_bot::error::Result;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "foreman-botd")]
#[command(about = "Foreman Bot command bridge daemon")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 7979)]
    port: u16,

    #[arg(long, default_value = "./data/foreman-bot.json")]
    config: String,

    #[arg(long, env = "FOREMAN_BOT_TOKEN", default_value = "")]
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,foreman_bot=info,rdkafka=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    daemon::run_with_shutdown(&cli.host, cli.port, &cli.config, &cli.token, shutdown).await
}
