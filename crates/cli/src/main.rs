use clap::Parser;

use tierflow_cli::{Cli, Settings, app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    tierflow_observability::init_with(&settings.log);

    app::run(cli.command, settings).await
}
