use clap::Parser;
use talk_to_salesforce::core::pipeline::{run, GoogleBackends};
use talk_to_salesforce::utils::logger;
use talk_to_salesforce::{CliConfig, DispatchSummary};

#[tokio::main]
async fn main() {
    let config = CliConfig::parse();
    logger::init_cli_logger(config.verbose);

    tracing::info!("Starting talk-to-salesforce");
    if config.verbose {
        tracing::debug!("CLI config: {:?}", config);
    }

    match run(&config, &GoogleBackends::from_env()).await {
        Ok(summary) => {
            print_summary(&summary);
        }
        Err(e) => {
            tracing::error!("Run failed: {}", e);
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_summary(summary: &DispatchSummary) {
    println!("Batches sent: {}", summary.batches_sent);
    println!("Records sent: {}", summary.records_sent);
    println!("Succeeded:    {}", summary.succeeded);
    println!("Failed:       {}", summary.failed);
    for failure in &summary.failures {
        println!("  record {}: {}", failure.record, failure.errors.join("; "));
    }
}
