use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands, GlobalArgs, LogLevel, PeerCommands, RouterCommands};
use env_logger::Target;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use log::LevelFilter;

use crate::{
    commands::{
        claim_peer::claim_peer,
        crds::{apply_crds, print_crds},
        list_peers::list_peers,
    },
    controller::main_controller,
    router::main_router_init,
};

mod cli;
mod commands;
mod config;
mod controller;
mod exec;
mod helpers;
mod output;
mod router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    configure_logging(&cli.global_args);

    match cli.command {
        None | Some(Commands::Controller) => {
            let config = cli.config.validated()?;
            let client = create_client(&cli.global_args).await?;

            main_controller(client, config).await;
        }
        Some(Commands::Router(RouterCommands::Init)) => {
            let client = create_client(&cli.global_args).await?;

            main_router_init(client).await?;
        }
        Some(Commands::Crds(args)) => {
            if args.apply {
                apply_crds(&create_client(&cli.global_args).await?).await?;
            } else {
                print_crds()?;
            }
        }
        Some(Commands::Peer(command)) => {
            let client = create_client(&cli.global_args).await?;
            let namespace = cli
                .config
                .namespace
                .to_owned()
                .unwrap_or_else(|| client.default_namespace().to_owned());

            match command {
                PeerCommands::List(args) => list_peers(args, &namespace, client).await?,
                PeerCommands::Claim(args) => claim_peer(args, &namespace, client).await?,
            }
        }
    }

    Ok(())
}

/// Explicit kubeconfig settings win, otherwise the usual inference applies
/// (local kubeconfig, then the in-cluster service account).
async fn create_client(global_args: &GlobalArgs) -> anyhow::Result<Client> {
    let config = if global_args.kube_config.is_some() || global_args.kube_context.is_some() {
        let options = KubeConfigOptions {
            context: global_args.kube_context.to_owned(),
            ..Default::default()
        };

        match &global_args.kube_config {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &options).await?
            }
            None => Config::from_kubeconfig(&options).await?,
        }
    } else {
        Config::infer().await?
    };

    Client::try_from(config).context("Couldn't initialize k8s API client!")
}

fn configure_logging(global_args: &GlobalArgs) {
    let log_level = global_args.get_log_level();
    let mut logger = env_logger::builder();

    logger
        .format_module_path(matches!(log_level, LogLevel::Trace))
        .format_target(false)
        .target(Target::Stderr);

    match log_level {
        LogLevel::Normal => {
            logger.filter(Some("vpn_fleet_agent"), LevelFilter::Info);
            logger.filter(Some("vpn_fleet_core"), LevelFilter::Info);
        }
        LogLevel::Verbose => {
            logger.filter(Some("vpn_fleet_agent"), LevelFilter::Debug);
            logger.filter(Some("vpn_fleet_core"), LevelFilter::Debug);
        }
        LogLevel::Trace => {
            logger.filter(None, LevelFilter::Debug);
        }
    }

    logger.parse_default_env().init();
}
