use anyhow::Context as _;
use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::WatchEvent;
use kube_infra::{
    builder::{ConfigMapBuilder, NamespaceBuilder, PodBuilder},
    poll::PollParams,
    watch::condition,
};
use std::{collections::BTreeMap, time::Duration};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
struct Args {
    /// Namespace to work in
    #[arg(long, default_value = "default")]
    namespace: String,
    /// How long each wait may take, in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// How often to check the cluster, in milliseconds
    #[arg(long)]
    interval: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates a namespace and waits until it is active
    Namespace { name: String },
    /// Runs a pod until it is running, then deletes it
    Pod {
        name: String,
        #[arg(long, default_value = "busybox")]
        image: String,
    },
    /// Creates a configmap and waits until someone annotates it
    /// with `key`
    Annotate { name: String, key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    let params = PollParams {
        interval: args.interval.map(Duration::from_millis),
        timeout: args.timeout.map(Duration::from_secs),
    };
    let timeout = params.timeout();

    tracing::info!("Connecting to kube");
    let k = kube::Client::try_default().await?;

    match args.command {
        Command::Namespace { name } => {
            let mut ns = NamespaceBuilder::new(k, &name);
            ns.with_label("app.kubernetes.io/managed-by", "example-wait")
                .with_poll_interval(params.interval());
            ns.create().await?;
            ns.wait_until_active(timeout).await?;
            tracing::info!(namespace = name.as_str(), "Namespace is active");
        }
        Command::Pod { name, image } => {
            let mut pod = PodBuilder::new(k, &name, &args.namespace, &image);
            pod.with_command(vec!["sleep".to_string(), "3600".to_string()])
                .with_poll_interval(params.interval());
            pod.create().await?;
            pod.wait_until_running(timeout)
                .await
                .context("pod did not start")?;
            tracing::info!(pod = name.as_str(), "Pod is running, deleting it");
            pod.delete_and_wait(timeout).await?;
        }
        Command::Annotate { name, key } => {
            let mut cm = ConfigMapBuilder::new(k, &name, &args.namespace);
            cm.with_data(BTreeMap::from([("created-by".to_string(), "example-wait".to_string())]));
            cm.create().await?;

            let token = CancellationToken::new();
            let cancel = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            tracing::info!(configmap = name.as_str(), key = key.as_str(), "Waiting for annotation");
            let wanted = key.clone();
            let handle = cm
                .watch_until(
                    &token,
                    timeout,
                    condition(move |_, event: &WatchEvent<ConfigMap>| match event {
                        WatchEvent::Deleted(_) => anyhow::bail!("configmap was deleted"),
                        WatchEvent::Added(cm) | WatchEvent::Modified(cm) => Ok(cm
                            .metadata
                            .annotations
                            .as_ref()
                            .map_or(false, |a| a.contains_key(&wanted))),
                        _ => Ok(false),
                    }),
                )
                .await?;
            handle.wait().await?;
            tracing::info!("Annotation appeared");
        }
    }
    Ok(())
}
