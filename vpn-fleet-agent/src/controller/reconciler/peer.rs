use chrono::Utc;
use kube::runtime::controller::Action;
use log::{info, warn};
use vpn_fleet_core::{
    helpers::RequireMetadata,
    peers::manager::{PeerError, RevokeOutcome, ServerProfile},
    resources::{
        crd::v1alpha1::{
            vpnpeer::{VPNPeer, VPNPeerState},
            vpnserver::VPNServer,
        },
        key::ServerKey,
        profile::{generate_profile_secret, is_profile_expired, profile_secret_name},
        ResourceGenerationError,
    },
    wireguard::{interface::InterfaceTarget, keys::WgKey, peer_config::PeerConfig},
};

use crate::controller::workloads::PeerState;

use super::{context::ReconcilerContext, error::ReconcilerError};

/// Peer-facing view of a server, `None` until the server has a valid spec and a key.
pub fn server_profile(server: &VPNServer, keepalive: u16) -> Option<ServerProfile> {
    let key = ServerKey::from_resource(server)?;
    let spec = server.spec.validate().ok()?;
    let status = server.status.as_ref()?;
    let public_key = WgKey::from_base64(status.public_key.as_deref()?).ok()?;

    Some(ServerProfile {
        target: InterfaceTarget::new(key, &server.spec.interface),
        address: spec.address,
        dns: spec.dns,
        client_allowed_ips: spec.allowed_ips,
        endpoint: status.endpoint.to_owned(),
        public_key,
        keepalive,
    })
}

/// Creates the peer on its server, or rotates its key when a rotation was requested.
///
/// Whether a rotation is due is decided from the stored record, the object handed
/// to the reconciler may predate the last rotation.
pub async fn apply_peer(
    object: &VPNPeer,
    context: &ReconcilerContext,
) -> Result<Action, ReconcilerError> {
    let name = object.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = object.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let server_name = &object.spec.server;
    let rotation = object.spec.rotation;

    let server = context
        .api_call(context.status.get_server(namespace, server_name))
        .await?;
    let profile = match server
        .as_ref()
        .and_then(|server| server_profile(server, context.config.keepalive_secs))
    {
        Some(profile) => profile,
        None => {
            let state = PeerState {
                state: VPNPeerState::ErrorServerNotReady,
                message: Some(format!("Server '{server_name}' isn't ready for peers yet!")),
            };

            update_state(object, context, state).await?;

            return Ok(Action::requeue(context.config.resync()));
        }
    };

    let record = context
        .peers
        .list_peers(profile.key())
        .await?
        .into_iter()
        .find(|peer| peer.active && peer.name == name);

    let (result, rotating) = match record {
        None => (context.peers.create_peer(&profile, name, rotation).await, false),
        Some(record) if rotation > record.rotation => {
            (context.peers.rotate_key(&profile, name, rotation).await, true)
        }
        Some(_) => return settle_peer(object, context).await,
    };

    let config = match result {
        Ok(config) => config,
        // another pass already answered this rotation
        Err(PeerError::AlreadyRotated(..)) => return settle_peer(object, context).await,
        Err(error) => return report_peer_error(object, context, error).await,
    };

    if let Err(error) = store_profile(object, context, config).await {
        // without a profile the new key is unusable
        if rotating {
            warn!(
                "Couldn't store the rotated profile of peer '{name}', raise its rotation again for a new one! {error}"
            );
        } else {
            warn!("Couldn't store the profile of peer '{name}', revoking it! {error}");

            if let Err(revoke) = context.peers.revoke_peer(&profile.target, name).await {
                warn!("Couldn't revoke peer '{name}' after losing its profile! {revoke}");
            }
        }

        return Err(error);
    }

    update_state(object, context, active_state()).await?;

    Ok(Action::requeue(context.config.resync()))
}

/// Nothing to change on the server, only the profile's claim window is enforced.
async fn settle_peer(
    object: &VPNPeer,
    context: &ReconcilerContext,
) -> Result<Action, ReconcilerError> {
    expire_profile(object, context).await?;
    update_state(object, context, active_state()).await?;

    Ok(Action::requeue(context.config.resync()))
}

fn active_state() -> PeerState {
    PeerState {
        state: VPNPeerState::Active,
        message: None,
    }
}

/// Revokes the peer. A server that's gone has no peers left to revoke.
pub async fn cleanup_peer(
    object: &VPNPeer,
    context: &ReconcilerContext,
) -> Result<Action, ReconcilerError> {
    let name = object.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = object.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let server_name = &object.spec.server;

    let server = match context
        .api_call(context.status.get_server(namespace, server_name))
        .await?
    {
        Some(server) => server,
        None => {
            info!("Server '{server_name}' of peer '{name}' is gone, nothing to revoke!");

            return Ok(Action::await_change());
        }
    };

    let target = InterfaceTarget::new(
        ServerKey::new(namespace, server_name),
        &server.spec.interface,
    );

    match context.peers.revoke_peer(&target, name).await {
        Ok(RevokeOutcome::Revoked(_) | RevokeOutcome::AlreadyRevoked) => {}
        Err(PeerError::NotFound(_)) => {
            info!("Peer '{name}' has no record on '{server_name}', nothing to revoke!")
        }
        Err(error) => return Err(error.into()),
    }

    Ok(Action::await_change())
}

async fn store_profile(
    object: &VPNPeer,
    context: &ReconcilerContext,
    mut config: PeerConfig,
) -> Result<(), ReconcilerError> {
    let profile = config.claim_profile().map_err(|_| {
        ResourceGenerationError::InvalidData("peer profile was already claimed".into())
    })?;
    let deadline = Utc::now() + context.config.claim_window();
    let secret = generate_profile_secret(object, profile, deadline)?;

    context
        .api_call(context.workloads.apply_secret(&secret))
        .await?;

    info!(
        "Profile of peer '{}' is ready to be claimed until {deadline}!",
        config.peer_name
    );

    Ok(())
}

/// Drops the profile once its claim window has passed.
async fn expire_profile(object: &VPNPeer, context: &ReconcilerContext) -> Result<(), ReconcilerError> {
    let name = object.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = object.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let secret_name = profile_secret_name(name);

    let secret = match context
        .api_call(context.workloads.get_secret(namespace, &secret_name))
        .await?
    {
        Some(secret) => secret,
        None => return Ok(()),
    };

    if is_profile_expired(&secret, Utc::now()) {
        info!("Profile of peer '{name}' wasn't claimed in time, removing it!");

        context
            .api_call(context.workloads.delete_secret(namespace, &secret_name))
            .await?;
    }

    Ok(())
}

/// Rejected operations only show up on the peer, they never fail the server.
async fn report_peer_error(
    object: &VPNPeer,
    context: &ReconcilerContext,
    error: PeerError,
) -> Result<Action, ReconcilerError> {
    let state = match &error {
        PeerError::PoolExhausted(_) => VPNPeerState::ErrorPoolExhausted,
        PeerError::DuplicateName(_) => VPNPeerState::ErrorDuplicateName,
        PeerError::InterfaceSync(_) => VPNPeerState::ErrorInterfaceSync,
        _ => return Err(error.into()),
    };

    warn!(
        "Peer '{}' couldn't be set up! {error}",
        object.metadata.name.as_deref().unwrap_or_default()
    );

    update_state(
        object,
        context,
        PeerState {
            state,
            message: Some(error.to_string()),
        },
    )
    .await?;

    match state {
        VPNPeerState::ErrorInterfaceSync => Err(error.into()),
        _ => Ok(Action::requeue(context.config.resync())),
    }
}

async fn update_state(
    object: &VPNPeer,
    context: &ReconcilerContext,
    state: PeerState,
) -> Result<(), ReconcilerError> {
    if PeerState::of(object).as_ref() == Some(&state) {
        return Ok(());
    }

    context
        .api_call(context.status.write_peer_state(object, &state))
        .await
}
