use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use flashq_master::{
    InMemoryMetadataStore, InMemoryOffsetStore, Master, MasterConfig, MetadataStore,
    manifest::ManifestLoader, telemetry,
};

#[derive(Parser, Debug)]
#[command(
    name = "flashq-master",
    version,
    author,
    about = "FlashQ coordination master"
)]
struct Args {
    /// Master configuration file (JSON or YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Broker and black-list manifest seeding the metadata store
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Start as a standby: every request is answered with a not-leader error
    #[arg(long, default_value_t = false)]
    standby: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = telemetry::DEFAULT_FILTER)]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    telemetry::init_with_filter(&args.log_filter);

    let config = match &args.config {
        Some(path) => MasterConfig::from_path(path)?,
        None => MasterConfig::default(),
    };

    let metadata_store = match &args.manifest {
        Some(path) => InMemoryMetadataStore::new_with_manifest(ManifestLoader::from_path(path)?)?,
        None => InMemoryMetadataStore::new(),
    };
    metadata_store.set_primary(!args.standby);
    let configured_brokers = metadata_store.broker_confs().len();

    let master = Master::new(
        config,
        Arc::new(metadata_store),
        Arc::new(InMemoryOffsetStore::new()),
    )?;
    master.start();
    tracing::info!(
        address = %master.config().address(),
        standby = args.standby,
        configured_brokers,
        "FlashQ master running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    master.stop();
    master.wait_for_rebalance().await;
    Ok(())
}
