use clap::Parser;
use tracing_subscriber::EnvFilter;

use foreman_bot::config::Config;
use foreman_bot::domains::message::ContainerSpec;
use foreman_bot::error::Result;
use foreman_bot::ForemanBot;

#[derive(Parser, Debug)]
#[command(name = "foreman-bot")]
#[command(about = "Foreman Bot operator CLI")]
struct Cli {
    #[arg(long, default_value = "./data/foreman-bot.json")]
    config: String,

    #[arg(long)]
    server_key: String,

    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    CpuTemp,
    Memory,
    Disk,
    Uptime,
    Processes,
    Network,
    Containers,
    Start {
        #[arg(long)]
        name: String,
    },
    Stop {
        #[arg(long)]
        name: String,
    },
    Restart {
        #[arg(long)]
        name: String,
    },
    Remove {
        #[arg(long)]
        name: String,
    },
    Create {
        #[arg(long)]
        name: String,

        #[arg(long)]
        image: String,

        #[arg(long = "port")]
        ports: Vec<String>,

        #[arg(long = "env")]
        env: Vec<String>,

        #[arg(long = "volume")]
        volumes: Vec<String>,
    },
    UpdateAgent,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,foreman_bot=info,rdkafka=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    let mut config = Config::from_file(&cli.config)?;
    if cli.timeout_ms.is_some() {
        config.command_timeout_ms = cli.timeout_ms;
    }
    let bot = ForemanBot::from_config(config).await?;
    let key = cli.server_key.as_str();

    let output = match cli.command {
        Commands::CpuTemp => to_json(&bot.cpu_temp(key).await?)?,
        Commands::Memory => to_json(&bot.memory_info(key).await?)?,
        Commands::Disk => to_json(&bot.disk_info(key).await?)?,
        Commands::Uptime => to_json(&bot.uptime(key).await?)?,
        Commands::Processes => to_json(&bot.processes(key).await?)?,
        Commands::Network => to_json(&bot.network_info(key).await?)?,
        Commands::Containers => to_json(&bot.containers(key).await?)?,
        Commands::Start { name } => to_json(&bot.start_container(key, &name).await?)?,
        Commands::Stop { name } => to_json(&bot.stop_container(key, &name).await?)?,
        Commands::Restart { name } => to_json(&bot.restart_container(key, &name).await?)?,
        Commands::Remove { name } => to_json(&bot.remove_container(key, &name).await?)?,
        Commands::Create {
            name,
            image,
            ports,
            env,
            volumes,
        } => {
            let spec = ContainerSpec {
                name,
                image,
                ports,
                env,
                volumes,
            };
            to_json(&bot.create_container(key, &spec).await?)?
        }
        Commands::UpdateAgent => to_json(&bot.update_agent(key).await?)?,
    };
    println!("{output}");

    bot.shutdown().await;
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| foreman_bot::ForemanBotError::Runtime(e.to_string()))
}
