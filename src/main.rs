mod narwhal;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "narwhal",
    version,
    about = "Narwhal - reverse tunnel relay for services behind NAT"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses NARWHAL_CONFIG; then narwhal.toml > narwhal.yaml > narwhal.yml in the CWD; then the OS default (Linux: /etc/narwhal/narwhal.toml; others: user config dir).
    #[arg(long, env = "NARWHAL_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Override the configured log level (debug | info | warn | error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    narwhal::run(cli.config, cli.log_level).await
}
