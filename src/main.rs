use sam_robot::cli::{Cli, Commands};
use sam_robot::error::Result;
use sam_robot::{commands, logger};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse_args();

    // Initialize logging system
    logger::init(args.verbose, args.json_log)?;

    debug!("samrobotd starting");

    match run(args).await {
        Ok(_) => {
            info!("Operation completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Operation failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    match args.command {
        Commands::Run { script, timeout } => {
            commands::run::execute(args.config, script, timeout).await
        }

        Commands::Mklabel {
            vsn,
            output,
            kind,
            block_size,
            info,
            sectors,
        } => commands::mklabel::execute(kind, vsn, output, block_size, info, sectors).await,

        Commands::Showlabel { image, kind, json } => {
            commands::showlabel::execute(kind, image, json).await
        }

        Commands::Config { save } => commands::config::execute(args.config, save).await,
    }
}
