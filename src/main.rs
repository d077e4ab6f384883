#[macro_use]
extern crate tracing;

use agones_minecraft::{
    cache::HostnameCache,
    context::Context,
    dns::cloud::CloudDnsApi,
    reconcile::{
        self,
        DnsRecordResource as _,
    },
    resources::GameServer,
};
use clap::Parser;
use eyre::Result;
use futures::{
    future,
    StreamExt as _,
    TryStreamExt as _,
};
use k8s_openapi::api::core::v1::Node;
use kube::{
    runtime::{
        reflector,
        watcher,
        Controller,
        WatchStreamExt as _,
    },
    Api,
};
use std::{
    sync::Arc,
    time::Duration,
};

#[derive(Parser)]
#[command(version, about)]
enum Args {
    Controller(ArgsController),
    Migrate(ArgsMigrate),
}

#[derive(Parser)]
struct ArgsController {
    #[clap(long, env = "DNS_PROJECT_ID", help = "Cloud DNS project id")]
    project_id: String,

    #[clap(long = "zone", env = "DNS_MANAGED_ZONE", help = "Cloud DNS managed zone name")]
    managed_zone: String,

    #[clap(long, env = "DNS_API_TOKEN", help = "Cloud DNS API token")]
    dns_api_token: String,

    #[clap(
        long,
        env = "GAMESERVER_NAMESPACE",
        default_value = "default",
        help = "Namespace the game servers run in"
    )]
    namespace: String,

    #[clap(
        long,
        env = "DNS_PROVIDER_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "30s",
        help = "Timeout for provider API calls"
    )]
    provider_timeout: Duration,
}

#[derive(Parser)]
struct ArgsMigrate {
    #[clap(long, env = "DATABASE_URL", help = "Postgres connection string")]
    database_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install().expect("color_eyre init");
    tracing_subscriber::fmt::init();

    match Args::parse() {
        Args::Controller(args) => run_controller(args).await?,
        Args::Migrate(args) => run_migrations(args).await?,
    }

    Ok(())
}

async fn run_migrations(ArgsMigrate { database_url }: ArgsMigrate) -> Result<()> {
    let pool = sqlx::PgPool::connect(&database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("migrations applied");
    Ok(())
}

async fn run_controller(args: ArgsController) -> Result<()> {
    let client = kube::Client::try_default().await?;

    let dns = Arc::new(
        CloudDnsApi::new(args.project_id, args.managed_zone, args.dns_api_token).with_timeout(args.provider_timeout),
    );
    let context = Arc::new(Context {
        client: client.clone(),
        namespace: args.namespace.clone(),
        dns,
    });

    // The hostname cache and the reconciler are fed from one watch so they
    // never disagree about which game servers exist. The cache is the index
    // the registry service consults for availability checks when embedded.
    let cache = Arc::new(HostnameCache::new());
    let game_servers = Api::<GameServer>::namespaced(client.clone(), &args.namespace);
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(game_servers, watcher::Config::default()))
        .default_backoff()
        .inspect_ok(move |event| cache.observe(event))
        .applied_objects()
        // events without an address and port allocation never reach the
        // reconciler, except deletions which must release the finalizer
        .try_filter(|gs| future::ready(gs.dns_ready() || gs.metadata.deletion_timestamp.is_some()));

    let nodes = Api::<Node>::all(client);
    let (node_reader, node_writer) = reflector::store();
    let node_stream = reflector(node_writer, watcher(nodes, watcher::Config::default()))
        .default_backoff()
        .applied_objects()
        .try_filter(|node| future::ready(node.dns_ready() || node.metadata.deletion_timestamp.is_some()));

    info!("starting controllers");

    let game_server_controller = Controller::for_stream(stream, reader)
        .shutdown_on_signal()
        .run(reconcile::reconcile_dns, reconcile::error_policy, context.clone())
        .for_each(|msg| async move { trace!("reconciled game server: {msg:?}") });

    let node_controller = Controller::for_stream(node_stream, node_reader)
        .shutdown_on_signal()
        .run(reconcile::reconcile_dns, reconcile::error_policy, context)
        .for_each(|msg| async move { trace!("reconciled node: {msg:?}") });

    tokio::join!(game_server_controller, node_controller);

    info!("controllers stopped");

    Ok(())
}
