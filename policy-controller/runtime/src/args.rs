use crate::{
    core::{IpNet, Memory},
    index::Index,
    k8s, Backend, Commands,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use std::path::PathBuf;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "netpol", about = "A NetworkPolicy controller")]
pub struct Args {
    #[clap(long, default_value = "netpol=info,warn", env = "NETPOL_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "ipset", env = "NETPOL_IPSET")]
    ipset_path: PathBuf,

    #[clap(long, default_value = "iptables", env = "NETPOL_IPTABLES")]
    iptables_path: PathBuf,

    /// Network CIDRs of pod IPs.
    ///
    /// Traffic to these networks that no rule accepts is dropped. The default includes all
    /// private networks.
    #[clap(
        long,
        default_value = "10.0.0.0/8,100.64.0.0/10,172.16.0.0/12,192.168.0.0/16"
    )]
    pod_networks: IpNets,

    /// Applies changes to an in-memory model instead of the host's packet filter.
    #[clap(long)]
    dry_run: bool,

    /// Leaves the controller's chains and the `FORWARD` hook to be provisioned externally.
    #[clap(long)]
    skip_chain_setup: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            ipset_path,
            iptables_path,
            pod_networks: IpNets(pod_networks),
            dry_run,
            skip_chain_setup,
        } = self;

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder())
            .with_client(client)
            .build()
            .await?;

        let backend = if dry_run {
            info!("Dry run: the host's packet filter will not be modified");
            Backend::DryRun(Memory::default())
        } else {
            let commands = Commands::new(ipset_path, iptables_path);
            if !skip_chain_setup {
                commands.init_chains(&pod_networks)?;
            }
            Backend::Commands(commands)
        };

        // Build the index that translates cluster state into packet filter configuration.
        let index = Index::shared(backend);

        // Spawn resource watches.

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces).instrument(info_span!("namespaces")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let network_policies =
            runtime.watch_all::<k8s::NetworkPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index, network_policies)
                .instrument(info_span!("networkpolicies")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
struct IpNets(Vec<IpNet>);

impl std::str::FromStr for IpNets {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(|n| n.parse().map_err(Into::into))
            .collect::<Result<Vec<IpNet>>>()
            .map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let args = Args::try_parse_from(["netpol"]).expect("defaults must parse");
        assert_eq!(args.ipset_path, PathBuf::from("ipset"));
        assert_eq!(args.iptables_path, PathBuf::from("iptables"));
        assert_eq!(args.pod_networks.0.len(), 4);
        assert!(!args.dry_run);
        assert!(!args.skip_chain_setup);
    }

    #[test]
    fn parses_pod_networks() {
        let args = Args::try_parse_from([
            "netpol",
            "--pod-networks",
            "10.42.0.0/16,fd00:10:42::/56",
            "--dry-run",
        ])
        .expect("args must parse");
        assert_eq!(
            args.pod_networks.0,
            vec![
                "10.42.0.0/16".parse::<IpNet>().unwrap(),
                "fd00:10:42::/56".parse::<IpNet>().unwrap(),
            ]
        );
        assert!(args.dry_run);

        assert!(Args::try_parse_from(["netpol", "--pod-networks", "10.42.0.0"]).is_err());
    }
}
