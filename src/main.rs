use clap::Parser;
use drive_photo_search::Opts;
use drive_photo_search::cli::SubCommandExtend;
use drive_photo_search::config::SubCommand;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Server(config) => config.run(&opts).await,
        SubCommand::Import(config) => config.run(&opts).await,
        SubCommand::Search(config) => config.run(&opts).await,
        SubCommand::Migrate(config) => config.run(&opts).await,
    }
}
