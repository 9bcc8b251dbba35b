use anyhow::Context;
use kube::{api::PatchParams, Client};
use log::info;
use vpn_fleet_core::{
    resources::crd::v1alpha1::{create_v1alpha1_crds, v1alpha1_crds_yaml},
    CONTROLLER_FIELD_MANAGER,
};

pub fn print_crds() -> anyhow::Result<()> {
    print!("{}", v1alpha1_crds_yaml()?);

    Ok(())
}

pub async fn apply_crds(client: &Client) -> anyhow::Result<()> {
    let apply_params = PatchParams::apply(CONTROLLER_FIELD_MANAGER).force();

    create_v1alpha1_crds(client, &apply_params)
        .await
        .context("Couldn't apply the custom resource definitions!")?;

    info!("Custom resource definitions applied!");

    Ok(())
}
