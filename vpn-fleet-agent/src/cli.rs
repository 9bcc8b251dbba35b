use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::AgentConfig;

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    #[command(flatten)]
    pub global_args: GlobalArgs,
    #[command(flatten)]
    pub config: AgentConfig,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// override default kubeconfig
    #[arg(long, global = true)]
    pub kube_config: Option<String>,
    /// override default kubeconfig context
    #[arg(long, global = true)]
    pub kube_context: Option<String>,
    /// enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose_logging: bool,
    /// enable trace output (more detailed than verbose, overrides it if present)
    #[arg(long = "trace", global = true)]
    pub trace_logging: bool,
}

impl GlobalArgs {
    pub fn get_log_level(&self) -> LogLevel {
        if self.trace_logging {
            return LogLevel::Trace;
        }

        if self.verbose_logging {
            return LogLevel::Verbose;
        }

        LogLevel::Normal
    }
}

pub enum LogLevel {
    Normal,
    Verbose,
    Trace,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// run the VPNServer and VPNPeer controllers (default)
    Controller,
    /// commands executed inside VPN server pods
    #[command(subcommand)]
    Router(RouterCommands),
    /// print the custom resource definitions
    Crds(CrdsArgs),
    /// inspect and claim peers
    #[command(subcommand)]
    Peer(PeerCommands),
}

#[derive(Debug, Subcommand)]
pub enum RouterCommands {
    /// render the full WireGuard configuration of the server into the shared volume
    Init,
}

#[derive(Debug, Args)]
pub struct CrdsArgs {
    /// apply the definitions to the cluster instead of printing them
    #[arg(long)]
    pub apply: bool,
}

#[derive(Debug, Subcommand)]
pub enum PeerCommands {
    /// list peers of a server
    #[command(alias = "ls")]
    List(PeerListArgs),
    /// print the one-time client profile of a peer and remove it from the cluster
    Claim(PeerClaimArgs),
}

#[derive(Debug, Args)]
pub struct PeerListArgs {
    /// name of the VPNServer
    pub server: String,
    /// output format
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::TableWithHeaders)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct PeerClaimArgs {
    /// name of the VPNPeer
    pub peer: String,
    /// write the profile to a file instead of stdout
    #[arg(short = 'o', long)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    #[value(name = "names")]
    Names,
    #[value(name = "table")]
    Table,
    #[value(name = "wide")]
    TableWithHeaders,
    #[value(name = "json")]
    Json,
    #[value(name = "json-pretty")]
    JsonPretty,
    #[value(name = "yaml")]
    Yaml,
}
