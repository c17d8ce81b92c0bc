use crate::{
    core::{dataplane::State, Dataplane},
    index::{self, ClusterInfo},
    k8s, sink,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use tokio::sync::mpsc;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "netpol", about = "A NetworkPolicy enforcement controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "netpol=info,warn",
        env = "NETPOL_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The packet-filtering backend that enforces compiled policies
    /// (`linux` or `windows`).
    #[clap(long, default_value = "linux")]
    dataplane: Dataplane,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            dataplane,
        } = self;

        // Peers with combined selectors are skipped until the API server's
        // version is known.
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let index = index::Index::shared(
            ClusterInfo {
                combined_selectors_and: false,
                dataplane,
            },
            updates_tx,
        );

        let mut prom = <Registry>::default();
        index::metrics::register(
            prom.sub_registry_with_prefix("network_policy_index"),
            index.clone(),
        );
        let sink_metrics = sink::SinkMetrics::register(prom.sub_registry_with_prefix("dataplane"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let version = runtime.client().apiserver_version().await?;
        let combined_selectors_and =
            ClusterInfo::supports_combined_selectors(&version.major, &version.minor);
        info!(
            major = %version.major,
            minor = %version.minor,
            combined_selectors_and,
            "Discovered API server version"
        );
        {
            let mut index = index.write();
            let ops = index.set_cluster_info(ClusterInfo {
                combined_selectors_and,
                dataplane,
            });
            index.publish(ops);
        }

        // Apply backend operations in the order the index emits them.
        tokio::spawn(
            sink::run(updates_rx, State::default(), sink_metrics)
                .instrument(info_span!("dataplane", %dataplane)),
        );

        // Spawn resource watches.

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces)
                .instrument(info_span!("namespaces")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let network_policies = runtime.watch_all::<k8s::NetworkPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index, network_policies)
                .instrument(info_span!("networkpolicies")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
