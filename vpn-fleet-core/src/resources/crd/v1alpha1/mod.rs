use kube::{api::PatchParams, Client, CustomResourceExt};

use crate::kubernetes::operations::apply_crd;

use self::{vpnpeer::VPNPeer, vpnserver::VPNServer};

pub mod conditions;
pub mod vpnpeer;
pub mod vpnserver;

pub async fn create_v1alpha1_crds(client: &Client, apply_params: &PatchParams) -> Result<(), kube::Error> {
    apply_crd(client, &VPNServer::crd(), apply_params).await?;
    apply_crd(client, &VPNPeer::crd(), apply_params).await?;

    Ok(())
}

/// Multi-document YAML of every CRD, ready for `kubectl apply -f -`.
pub fn v1alpha1_crds_yaml() -> Result<String, serde_yaml::Error> {
    let server = serde_yaml::to_string(&VPNServer::crd())?;
    let peer = serde_yaml::to_string(&VPNPeer::crd())?;

    Ok(format!("{server}---\n{peer}"))
}
