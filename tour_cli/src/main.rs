use clap::Parser;
use tracing_subscriber::util::SubscriberInitExt;

use tour_cli::cli::{ClapArgs, SubCommands};
use tour_cli::setup::Application;
use tour_cli::{get_quit_notifier, telemetry};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let _ = dotenv::dotenv();
    color_eyre::install()?;

    let subscriber = telemetry::create_subscriber(
        "WARN,reqwest=DEBUG,tour_system=TRACE,tour_cli=TRACE,hyper=WARN",
    );
    subscriber.init();

    let args = ClapArgs::parse();
    let config = tour_cli::config::initialise_config()?;
    let app = Application::new(config).await?;

    match args.command {
        Some(SubCommands::Start) => app.run_one_shot_start().await?,
        Some(SubCommands::Ask { text }) => app.run_one_shot_ask(&text).await?,
        Some(SubCommands::Health) => app.run_one_shot_health().await?,
        None => {
            let notifier = get_quit_notifier();
            app.run(notifier).await?;
        }
    }

    Ok(())
}
