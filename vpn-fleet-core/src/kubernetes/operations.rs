use std::fmt::Debug;

use k8s_openapi::{
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    serde::{de::DeserializeOwned, Serialize},
    Metadata, NamespaceResourceScope,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams},
    core::ObjectMeta,
    Api, Client, Resource,
};
use log::{debug, info};
use serde_json::json;

use crate::helpers::pretty_type_name;

pub async fn apply_crd(
    client: &Client,
    crd: &CustomResourceDefinition,
    patch_params: &PatchParams,
) -> Result<(), kube::Error> {
    let crd_name = crd.metadata.name.as_deref().unwrap_or_default();
    let crd_apiversions = crd
        .spec
        .versions
        .iter()
        .map(|version| version.name.as_str())
        .collect::<Vec<&str>>()
        .join(", ");

    info!("Applying {crd_name} ({crd_apiversions}) CRD...");

    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    crd_api
        .patch(crd_name, patch_params, &Patch::Apply(crd))
        .await?;

    Ok(())
}

pub async fn apply_resource<T>(
    client: &Client,
    resource: &T,
    patch_params: &PatchParams,
) -> Result<T, kube::Error>
where
    T: Metadata<Ty = ObjectMeta>
        + Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Serialize
        + Clone
        + DeserializeOwned
        + Debug,
{
    let resource_name = resource.metadata().name.as_deref().unwrap_or_default();
    let namespace = resource.metadata().namespace.as_deref().unwrap_or_default();

    debug!(
        "Applying '{resource_name}' {} in '{namespace}' namespace...",
        pretty_type_name::<T>()
    );

    let resource_api: Api<T> = Api::namespaced(client.clone(), namespace);

    resource_api
        .patch(resource_name, patch_params, &Patch::Apply(resource))
        .await
}

/// Merge-patches the status subresource. With `resource_version` set the patch only
/// lands if the object wasn't modified in the meantime (409 otherwise).
pub async fn patch_resource_status<T, S>(
    client: &Client,
    status: &S,
    name: &str,
    namespace: &str,
    resource_version: Option<&str>,
    patch_params: &PatchParams,
) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let resource_api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = match resource_version {
        Some(version) => json!({
            "metadata": { "resourceVersion": version },
            "status": status,
        }),
        None => json!({ "status": status }),
    };

    debug!(
        "Patching status of '{name}' {} in '{namespace}' namespace...",
        pretty_type_name::<T>()
    );

    resource_api
        .patch_status(name, patch_params, &Patch::Merge(&patch))
        .await
}

pub async fn try_get_resource<T>(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<Option<T>, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let resource_api: Api<T> = Api::namespaced(client.clone(), namespace);

    resource_api.get_opt(name).await
}

pub async fn list_resources<T>(
    client: &Client,
    namespace: &str,
    list_params: &ListParams,
) -> Result<Vec<T>, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let resource_api: Api<T> = Api::namespaced(client.clone(), namespace);

    Ok(resource_api.list(list_params).await?.items)
}

/// Deletes the resource, a missing resource counts as removed.
pub async fn try_remove_resource<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    delete_params: &DeleteParams,
) -> Result<(), kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let resource_api: Api<T> = Api::namespaced(client.clone(), namespace);

    info!(
        "Removing '{name}' {} from '{namespace}' namespace...",
        pretty_type_name::<T>()
    );

    match resource_api.delete(name, delete_params).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(error) => Err(error),
    }
}
