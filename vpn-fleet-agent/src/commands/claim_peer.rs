use std::path::Path;

use anyhow::{anyhow, Context};
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{DeleteParams, Preconditions},
    Api, Client,
};
use log::info;
use vpn_fleet_core::{
    kubernetes::{is_conflict, is_not_found, operations::try_get_resource, GetApi},
    resources::profile::{is_profile_expired, profile_secret_name, read_profile},
};

use crate::cli::PeerClaimArgs;

/// Hands out the one-time client profile.
///
/// The profile is only shown once the exact secret that was read has been deleted,
/// of two concurrent claims only one gets it.
pub async fn claim_peer(args: PeerClaimArgs, namespace: &str, client: Client) -> anyhow::Result<()> {
    let unavailable = || {
        anyhow!(
            "Profile of peer '{}' was already claimed or expired! Raise its rotation to get a new one.",
            args.peer
        )
    };
    let secret_name = profile_secret_name(&args.peer);
    let secret = try_get_resource::<Secret>(&client, &secret_name, namespace)
        .await?
        .filter(|secret| !is_profile_expired(secret, Utc::now()))
        .ok_or_else(unavailable)?;
    let profile = read_profile(&secret)?;
    let params = claim_params(&secret)
        .ok_or_else(|| anyhow!("Profile of peer '{}' has no resource version!", args.peer))?;

    let api: Api<Secret> = client.namespaced_api(namespace);

    match api.delete(&secret_name, &params).await {
        Ok(_) => {}
        Err(error) if is_lost_claim(&error) => return Err(unavailable()),
        Err(error) => return Err(error).context("Couldn't remove the claimed profile!"),
    }

    match args.output {
        Some(output) => {
            tokio::fs::write(Path::new(&output), profile)
                .await
                .context(format!("Couldn't write the profile to {output}"))?;

            info!("Profile of peer '{}' written to {output}!", args.peer);
        }
        None => print!("{profile}"),
    }

    Ok(())
}

/// Deletes exactly the revision that was read, never a newer profile.
fn claim_params(secret: &Secret) -> Option<DeleteParams> {
    let uid = secret.metadata.uid.to_owned()?;
    let resource_version = secret.metadata.resource_version.to_owned()?;

    Some(DeleteParams {
        preconditions: Some(Preconditions {
            uid: Some(uid),
            resource_version: Some(resource_version),
        }),
        ..Default::default()
    })
}

/// Someone else claimed the profile first, or it was replaced in between.
fn is_lost_claim(error: &kube::Error) -> bool {
    is_not_found(error) || is_conflict(error)
}
