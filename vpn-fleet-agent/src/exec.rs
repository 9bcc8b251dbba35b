use std::io;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ipnet::{IpNet, Ipv4Net};
use itertools::Itertools;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{AttachParams, ListParams},
    Api, Client, ResourceExt,
};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use vpn_fleet_core::{
    kubernetes::GetApi,
    resources::{
        labels::get_server_listparams,
        server::pod::{is_pod_ready, is_pod_terminating, SERVER_CONTAINER_NAME},
    },
    wireguard::{
        interface::{merge_live, InterfaceControl, InterfaceError, InterfaceTarget, LivePeer},
        keys::WgKey,
    },
};

/// Drives the tunnel interface of ready instances through `wg` commands
/// executed in the server container.
///
/// A server-wide target reaches every ready instance, a per-instance target
/// only its own pod.
pub struct PodExecInterface {
    client: Client,
}

impl PodExecInterface {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
    ) -> Result<String, InterfaceError> {
        debug!("Executing '{}' in {namespace}/{pod}", command.join(" "));

        let api: Api<Pod> = self.client.namespaced_api(namespace);
        let params = AttachParams::default()
            .container(SERVER_CONTAINER_NAME)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut process = api
            .exec(pod, command, &params)
            .await
            .map_err(|error| InterfaceError::Command(format!("{pod}: {error}")))?;

        let (stdout, stderr) = read_streams(process.stdout(), process.stderr())
            .await
            .map_err(|error| InterfaceError::Command(format!("{pod}: {error}")))?;

        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };

        if let Err(error) = process.join().await {
            warn!("Exec session in {namespace}/{pod} didn't close cleanly! {error}");
        }

        match status {
            Some(status) if status.status.as_deref() == Some("Failure") => {
                let message = match stderr.trim() {
                    "" => status.message.unwrap_or_default(),
                    stderr => stderr.to_owned(),
                };

                Err(InterfaceError::Command(format!("{pod}: {message}")))
            }
            _ => Ok(stdout),
        }
    }

    /// Runs the command on every instance the target reaches. No instances is
    /// an error unless `optional`.
    async fn exec_on_instances(
        &self,
        target: &InterfaceTarget,
        command: Vec<String>,
        optional: bool,
    ) -> Result<Vec<String>, InterfaceError> {
        let instances = self.instances(target).await?;

        if instances.is_empty() {
            if optional {
                return Ok(Vec::new());
            }

            return Err(InterfaceError::Unavailable(target.to_string()));
        }

        let mut outputs = Vec::with_capacity(instances.len());

        for instance in instances {
            let Some(pod) = instance.instance.as_deref() else {
                continue;
            };

            outputs.push(
                self.exec(&target.server.namespace, pod, command.clone())
                    .await?,
            );
        }

        Ok(outputs)
    }
}

#[async_trait]
impl InterfaceControl for PodExecInterface {
    async fn add_peer(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
        allowed_ips: &[Ipv4Net],
    ) -> Result<(), InterfaceError> {
        self.exec_on_instances(target, set_peer_command(target, key, allowed_ips), false)
            .await?;

        Ok(())
    }

    async fn remove_peer(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
    ) -> Result<(), InterfaceError> {
        // new instances render their config from the peer records
        self.exec_on_instances(target, remove_peer_command(target, key), true)
            .await?;

        Ok(())
    }

    async fn set_allowed_ips(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
        allowed_ips: &[Ipv4Net],
    ) -> Result<(), InterfaceError> {
        self.exec_on_instances(target, set_peer_command(target, key, allowed_ips), false)
            .await?;

        Ok(())
    }

    async fn query_status(&self, target: &InterfaceTarget) -> Result<Vec<LivePeer>, InterfaceError> {
        let dumps = self
            .exec_on_instances(target, dump_command(target), false)
            .await?;
        let instances = dumps
            .iter()
            .map(|dump| parse_dump(dump))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(merge_live(instances))
    }

    async fn instances(&self, target: &InterfaceTarget) -> Result<Vec<InterfaceTarget>, InterfaceError> {
        if target.instance.is_some() {
            return Ok(vec![target.to_owned()]);
        }

        let api: Api<Pod> = self.client.namespaced_api(&target.server.namespace);
        let params: ListParams = get_server_listparams(&target.server.name);
        let pods = api
            .list(&params)
            .await
            .map_err(|error| InterfaceError::Command(error.to_string()))?;

        Ok(instance_targets(target, &pods.items))
    }
}

/// Ready instances that aren't shutting down.
fn instance_targets(target: &InterfaceTarget, pods: &[Pod]) -> Vec<InterfaceTarget> {
    pods.iter()
        .filter(|pod| is_pod_ready(pod) && !is_pod_terminating(pod))
        .map(|pod| target.on_instance(pod.name_any()))
        .collect()
}

/// Drains both streams at once, a command filling one pipe must not stall on the other.
async fn read_streams(
    stdout: Option<impl AsyncRead + Unpin>,
    stderr: Option<impl AsyncRead + Unpin>,
) -> io::Result<(String, String)> {
    let (stdout, stderr) = tokio::join!(read_stream(stdout), read_stream(stderr));

    Ok((stdout?, stderr?))
}

async fn read_stream(reader: Option<impl AsyncRead + Unpin>) -> io::Result<String> {
    let mut output = String::new();

    if let Some(mut reader) = reader {
        reader.read_to_string(&mut output).await?;
    }

    Ok(output)
}

fn set_peer_command(target: &InterfaceTarget, key: &WgKey, allowed_ips: &[Ipv4Net]) -> Vec<String> {
    vec![
        "wg".to_owned(),
        "set".to_owned(),
        target.interface.to_owned(),
        "peer".to_owned(),
        key.to_base64(),
        "allowed-ips".to_owned(),
        allowed_ips.iter().join(","),
    ]
}

fn remove_peer_command(target: &InterfaceTarget, key: &WgKey) -> Vec<String> {
    vec![
        "wg".to_owned(),
        "set".to_owned(),
        target.interface.to_owned(),
        "peer".to_owned(),
        key.to_base64(),
        "remove".to_owned(),
    ]
}

fn dump_command(target: &InterfaceTarget) -> Vec<String> {
    vec![
        "wg".to_owned(),
        "show".to_owned(),
        target.interface.to_owned(),
        "dump".to_owned(),
    ]
}

/// Parses `wg show <interface> dump`. The first line describes the interface itself,
/// every following one is a tab separated peer.
pub fn parse_dump(dump: &str) -> Result<Vec<LivePeer>, InterfaceError> {
    dump.lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(parse_dump_peer)
        .collect()
}

fn parse_dump_peer(line: &str) -> Result<LivePeer, InterfaceError> {
    let fields: Vec<&str> = line.split('\t').collect();
    let invalid = || InterfaceError::Status(format!("unexpected peer line '{line}'"));

    let [public_key, _preshared, _endpoint, allowed_ips, handshake, rx, tx, _keepalive] =
        fields.as_slice()
    else {
        return Err(invalid());
    };

    let public_key = WgKey::from_base64(public_key).map_err(|_| invalid())?;
    let allowed_ips = match *allowed_ips {
        "(none)" => Vec::new(),
        allowed_ips => allowed_ips
            .split(',')
            .map(|net| net.trim().parse::<IpNet>().map_err(|_| invalid()))
            .filter_map_ok(|net| match net {
                IpNet::V4(net) => Some(net),
                IpNet::V6(_) => None,
            })
            .collect::<Result<Vec<_>, _>>()?,
    };
    let last_handshake = match handshake.parse::<i64>().map_err(|_| invalid())? {
        0 => None,
        secs => Utc.timestamp_opt(secs, 0).single(),
    };

    Ok(LivePeer {
        public_key,
        allowed_ips,
        last_handshake,
        rx_bytes: rx.parse().map_err(|_| invalid())?,
        tx_bytes: tx.parse().map_err(|_| invalid())?,
    })
}
