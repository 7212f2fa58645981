use clap::{Arg, Command};
use commonware_runtime::{tokio, Metrics, Runner, Spawner};
use futures::future::try_join_all;
use tally_aggregator::{subscriber::Subscriber, Aggregator};
use tally_node::{config::Config, gateway::Gateway, server, telemetry};
use tracing::{error, info};

fn main() {
    // Parse arguments
    let matches = Command::new("tally-node")
        .about("aggregate operator attestations into quorum certificates")
        .arg(Arg::new("config").long("config").required(true))
        .get_matches();

    // Load config
    let config_file = matches.get_one::<String>("config").unwrap();
    let config_file = std::fs::read_to_string(config_file).expect("Could not read config file");
    let config: Config = serde_yaml::from_str(&config_file).expect("Could not parse config file");
    config.validate().expect("Invalid config");

    // Create logger
    let level = config.level().expect("Invalid log level");
    if config.log.json {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .with_line_number(true)
            .with_file(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_line_number(true)
            .with_file(true)
            .init();
    }

    // Start runtime
    let executor = tokio::Runner::default();
    executor.start(|context| async move {
        let gateway = Gateway::new(context.with_label("gateway"), &config.ledger)
            .expect("Could not create ledger client");
        let mut tasks = Vec::new();

        // Start telemetry (if configured)
        let telemetry = match &config.telemetry {
            Some(cfg) => {
                let (actor, mailbox) = telemetry::Actor::new(context.with_label("telemetry"), cfg)
                    .expect("Could not create telemetry client");
                tasks.push(actor.start());
                Some(mailbox)
            }
            None => None,
        };

        // Start aggregator
        let aggregator = Aggregator::new(
            context.with_label("aggregator"),
            gateway.clone(),
            telemetry,
            config.aggregator_config(),
        );
        tasks.push(aggregator.clone().start());

        // Follow new batches
        let subscriber = Subscriber::new(
            context.with_label("subscriber"),
            gateway,
            aggregator.clone(),
            config.subscriber_config(),
        );
        tasks.push(subscriber.start());

        // Serve operators
        let address = config.server.address;
        let app = server::rpc(aggregator);
        tasks.push(context.with_label("rpc").spawn(move |_| async move {
            server::run(address, app)
                .await
                .expect("Could not serve rpc");
        }));

        // Serve metrics
        let address = config.metrics.address;
        let app = server::metrics(context.clone());
        tasks.push(context.with_label("metrics").spawn(move |_| async move {
            server::run(address, app)
                .await
                .expect("Could not serve metrics");
        }));
        info!(
            rpc = %config.server.address,
            metrics = %config.metrics.address,
            threshold = config.aggregator.threshold,
            "started"
        );

        // Wait for any task to error
        if let Err(e) = try_join_all(tasks).await {
            error!(?e, "task failed");
        }
    });
}
