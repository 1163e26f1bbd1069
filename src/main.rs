use anyhow::{Context, Result};
use clap::Parser;
use sensor_data_client::cli::{Cli, Command};
use sensor_data_client::services::mqtt::{MqttBridge, MqttSettings};
use sensor_data_client::{ClientConfig, DataAccess};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_mqtt(
    command: &Command,
    config: &ClientConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let (bridge, task) = MqttBridge::connect(&MqttSettings::from_config(config))?;
    match command {
        Command::Publish(args) => {
            let payload: JsonValue =
                serde_json::from_str(&args.payload).context("--payload must be valid JSON")?;
            bridge.publish_json(&args.topic, &payload).await?;
            bridge.disconnect().await?;
            match tokio::time::timeout(Duration::from_secs(10), task).await {
                Ok(joined) => joined.context("mqtt event loop panicked")?,
                Err(_) => anyhow::bail!("timed out flushing publish to {}", args.topic),
            }
            print_json(&json!({"published": args.topic}))
        }
        Command::Subscribe(args) => {
            let mut subscription = bridge.subscribe(&args.topic).await?;
            let mut received = 0usize;
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = subscription.next() => message,
                };
                let Some(message) = message else { break };
                let payload = message.json().unwrap_or_else(|_| {
                    JsonValue::String(String::from_utf8_lossy(&message.payload).into_owned())
                });
                println!("{}", json!({"topic": message.topic, "payload": payload}));
                received += 1;
                if args.count.is_some_and(|count| received >= count) {
                    break;
                }
            }
            subscription.unsubscribe().await?;
            bridge.disconnect().await?;
            task.abort();
            Ok(())
        }
        _ => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = ClientConfig::from_env()?;
    if let Some(user_id) = cli.user_id.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        config.user_id = Some(user_id.to_string());
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; cancelling");
            on_signal.cancel();
        }
    });

    if matches!(cli.command, Command::Publish(_) | Command::Subscribe(_)) {
        return run_mqtt(&cli.command, &config, cancel).await;
    }

    let flags = cli.flags()?;
    let access = DataAccess::new(config)
        .context("failed to build data client")?
        .with_cancellation(cancel);

    match &cli.command {
        Command::FirstDp(args) => {
            let table = access
                .get_first_dp(&args.options(flags))
                .await
                .context("first-dp query failed")?;
            print_json(&table)
        }
        Command::LastDp(args) => {
            let table = access
                .get_dp(&args.options(flags))
                .await
                .context("last-dp query failed")?;
            print_json(&table)
        }
        Command::Query(args) => {
            let table = access
                .data_query(&args.options(flags))
                .await
                .context("range query failed")?;
            print_json(&table)
        }
        Command::LoadEntities(args) => {
            let entities = access
                .get_load_entities(args.filter(), flags.on_prem)
                .await
                .context("load entity listing failed")?;
            print_json(&entities)
        }
        Command::Devices => {
            let devices = access.metadata().get_device_details(flags.on_prem).await?;
            print_json(&devices)
        }
        Command::Metadata(args) => {
            let metadata = access
                .metadata()
                .get_device_metadata(&args.device, flags.on_prem)
                .await?;
            print_json(&metadata)
        }
        Command::Whoami => {
            let user = access.metadata().get_user_info(flags.on_prem).await?;
            let organisation = user.organisation_id();
            print_json(&json!({"user": user, "organisationId": organisation}))
        }
        Command::Publish(_) | Command::Subscribe(_) => Ok(()),
    }
}
