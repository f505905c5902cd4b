//! HTTP surface served by the leader.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::error;
use serde_json::json;

use super::{DaemonState, MASTER_SERVICE, PLUGIN_SERVICE, leader_addr};
use crate::intent::ServiceLbConfig;
use crate::master::endpoint::EndpointMatch;
use crate::master::{
    AddressAllocRequest, AddressAllocResponse, AddressReleaseRequest, CreateEndpointRequest,
    CreateEndpointResponse, DeleteEndpointRequest, DeleteEndpointResponse,
    SvcProviderUpdateRequest, UpdateEndpointRequest, UpdateEndpointResponse,
};
use crate::mastercfg::{
    EndpointState, NetworkState, ServiceLbState, SvcProviderState, StateRecord, list_records,
    read_record,
};
use crate::objapi::model::{
    self, App, EndpointGroup, Network, Policy, Rule, Service, ServiceInstance, Tenant, Volume,
    VolumeProfile,
};

type Shared = State<Arc<DaemonState>>;

/// Any handler error: HTTP 500 with the error text as body.
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("request failed: {:#}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn leader_router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/plugin/allocAddress", post(alloc_address))
        .route("/plugin/releaseAddress", post(release_address))
        .route("/plugin/createEndpoint", post(create_endpoint))
        .route("/plugin/deleteEndpoint", post(delete_endpoint))
        .route("/plugin/updateEndpoint", post(update_endpoint))
        .route("/plugin/svcProviderUpdate", post(svc_provider_update))
        .route("/version", get(version))
        .route("/info", get(info))
        .route("/networks", get(list_all::<NetworkState>))
        .route("/networks/{id}", get(get_one::<NetworkState>))
        .route("/endpoints", get(list_all::<EndpointState>))
        .route("/endpoints/{id}", get(get_one::<EndpointState>))
        .route("/services", get(list_all::<ServiceLbState>))
        .route("/services/{id}", get(get_one::<ServiceLbState>))
        .route(
            "/debug/epcleanup/tenant/{tenant}/{category}/{id}",
            delete(ep_cleanup),
        )
        .nest("/api/v1", model_router())
        .with_state(state)
}

async fn alloc_address(
    State(s): Shared,
    Json(req): Json<AddressAllocRequest>,
) -> ApiResult<Json<AddressAllocResponse>> {
    Ok(Json(s.master.alloc_address(&req).await?))
}

async fn release_address(
    State(s): Shared,
    Json(req): Json<AddressReleaseRequest>,
) -> ApiResult<Json<String>> {
    Ok(Json(s.master.release_address(&req).await?))
}

async fn create_endpoint(
    State(s): Shared,
    Json(req): Json<CreateEndpointRequest>,
) -> ApiResult<Json<CreateEndpointResponse>> {
    Ok(Json(s.master.create_endpoint_handler(&req).await?))
}

async fn delete_endpoint(
    State(s): Shared,
    Json(req): Json<DeleteEndpointRequest>,
) -> ApiResult<Json<DeleteEndpointResponse>> {
    Ok(Json(s.master.delete_endpoint_handler(&req).await?))
}

async fn update_endpoint(
    State(s): Shared,
    Json(req): Json<UpdateEndpointRequest>,
) -> ApiResult<Json<UpdateEndpointResponse>> {
    Ok(Json(s.master.update_endpoint(&req).await?))
}

async fn svc_provider_update(
    State(s): Shared,
    Json(req): Json<SvcProviderUpdateRequest>,
) -> ApiResult<Json<SvcProviderState>> {
    Ok(Json(s.master.svc_provider_refresh(&req).await?))
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn info(State(s): Shared) -> ApiResult<Json<serde_json::Value>> {
    let leader = leader_addr(s.lock.as_ref()).await?;
    let plugin_nodes: Vec<String> = s
        .registry
        .get_service(PLUGIN_SERVICE)
        .await
        .inspect_err(|e| error!("Error getting netplugin nodes. Err: {e}"))?
        .into_iter()
        .map(|srv| srv.host_addr)
        .collect();
    let master_nodes: Vec<String> = s
        .registry
        .get_service(MASTER_SERVICE)
        .await
        .inspect_err(|e| error!("Error getting netmaster nodes. Err: {e}"))?
        .into_iter()
        .map(|srv| srv.host_addr)
        .collect();
    Ok(Json(json!({
        "local-ip": s.local_ip,
        "leader-ip": leader,
        "current-state": s.current_mode().to_string(),
        "netplugin-nodes": plugin_nodes,
        "netmaster-nodes": master_nodes,
    })))
}

async fn list_all<T: StateRecord + 'static>(State(s): Shared) -> ApiResult<Json<Vec<T>>> {
    Ok(Json(list_records::<T>(s.master.driver()).await?))
}

async fn get_one<T: StateRecord + 'static>(
    State(s): Shared,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<T>>> {
    Ok(Json(vec![read_record::<T>(s.master.driver(), &id).await?]))
}

async fn ep_cleanup(
    State(s): Shared,
    Path((tenant, category, id)): Path<(String, String, String)>,
) -> ApiResult<String> {
    let what: EndpointMatch = category.parse()?;
    let msg = match what {
        EndpointMatch::Network => format!("Received request to cleanup Network with ID: {id}"),
        EndpointMatch::Group => format!("Received request to cleanup EPG with ID: {id}"),
        EndpointMatch::Endpoint => format!("Received request to cleanup Endpoint with ID: {id}"),
    };
    s.master.clear_endpoints(&tenant, what, &id).await?;
    Ok(msg)
}

fn model_router() -> Router<Arc<DaemonState>> {
    Router::new()
        .route("/tenants", get(list_model::<Tenant>).post(create_tenant))
        .route("/tenants/{tenant}", delete(delete_tenant))
        .route("/networks", get(list_model::<Network>).post(create_network))
        .route("/networks/{tenant}/{name}", delete(delete_network))
        .route(
            "/endpointGroups",
            get(list_model::<EndpointGroup>).post(create_endpoint_group),
        )
        .route("/endpointGroups/{tenant}/{name}", delete(delete_endpoint_group))
        .route("/policies", get(list_model::<Policy>).post(create_policy))
        .route("/policies/{tenant}/{name}", delete(delete_policy))
        .route("/rules", get(list_model::<Rule>).post(create_rule))
        .route("/rules/{tenant}/{policy}/{rule}", delete(delete_rule))
        .route("/apps", get(list_model::<App>).post(create_app))
        .route("/apps/{tenant}/{name}", delete(delete_app))
        .route("/services", get(list_model::<Service>).post(create_service))
        .route("/services/{tenant}/{app}/{name}", delete(delete_service))
        .route(
            "/serviceInstances",
            get(list_model::<ServiceInstance>).post(create_service_instance),
        )
        .route("/volumes", get(list_model::<Volume>).post(create_volume))
        .route(
            "/volumeProfiles",
            get(list_model::<VolumeProfile>).post(create_volume_profile),
        )
        .route("/serviceLBs", post(create_service_lb))
        .route("/serviceLBs/{tenant}/{name}", delete(delete_service_lb))
}

async fn list_model<T: model::ModelObject + 'static>(State(s): Shared) -> ApiResult<Json<Vec<T>>> {
    Ok(Json(model::list::<T>(s.master.driver()).await?))
}

async fn create_tenant(State(s): Shared, Json(t): Json<Tenant>) -> ApiResult<Json<Tenant>> {
    s.controller.create_tenant(&t).await?;
    Ok(Json(t))
}

async fn delete_tenant(State(s): Shared, Path(tenant): Path<String>) -> ApiResult<StatusCode> {
    s.controller.delete_tenant(&tenant).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_network(State(s): Shared, Json(n): Json<Network>) -> ApiResult<Json<Network>> {
    s.controller.create_network(&n).await?;
    Ok(Json(n))
}

async fn delete_network(
    State(s): Shared,
    Path((tenant, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    s.controller.delete_network(&tenant, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_endpoint_group(
    State(s): Shared,
    Json(g): Json<EndpointGroup>,
) -> ApiResult<Json<EndpointGroup>> {
    Ok(Json(s.controller.create_endpoint_group(&g).await?))
}

async fn delete_endpoint_group(
    State(s): Shared,
    Path((tenant, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    s.controller.delete_endpoint_group(&tenant, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_policy(State(s): Shared, Json(p): Json<Policy>) -> ApiResult<Json<Policy>> {
    s.controller.create_policy(&p).await?;
    Ok(Json(p))
}

async fn delete_policy(
    State(s): Shared,
    Path((tenant, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    s.controller.delete_policy(&tenant, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_rule(State(s): Shared, Json(r): Json<Rule>) -> ApiResult<Json<Rule>> {
    s.controller.create_rule(&r).await?;
    Ok(Json(r))
}

async fn delete_rule(
    State(s): Shared,
    Path((tenant, policy, rule)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    s.controller.delete_rule(&tenant, &policy, &rule).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_app(State(s): Shared, Json(a): Json<App>) -> ApiResult<Json<App>> {
    s.controller.create_app(&a).await?;
    Ok(Json(a))
}

async fn delete_app(
    State(s): Shared,
    Path((tenant, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    s.controller.delete_app(&tenant, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_service(State(s): Shared, Json(svc): Json<Service>) -> ApiResult<Json<Service>> {
    Ok(Json(s.controller.create_service(&svc).await?))
}

async fn delete_service(
    State(s): Shared,
    Path((tenant, app, name)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    s.controller.delete_service(&tenant, &app, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_service_instance(
    State(s): Shared,
    Json(inst): Json<ServiceInstance>,
) -> ApiResult<Json<ServiceInstance>> {
    s.controller.create_service_instance(&inst).await?;
    Ok(Json(inst))
}

async fn create_volume(State(s): Shared, Json(v): Json<Volume>) -> ApiResult<Json<Volume>> {
    s.controller.create_volume(&v).await?;
    Ok(Json(v))
}

async fn create_volume_profile(
    State(s): Shared,
    Json(p): Json<VolumeProfile>,
) -> ApiResult<Json<VolumeProfile>> {
    s.controller.create_volume_profile(&p).await?;
    Ok(Json(p))
}

async fn create_service_lb(
    State(s): Shared,
    Json(cfg): Json<ServiceLbConfig>,
) -> ApiResult<Json<ServiceLbState>> {
    s.master.create_service_lb(&cfg).await?;
    let id = crate::mastercfg::service_key(&cfg.service_name, &cfg.tenant);
    Ok(Json(read_record(s.master.driver(), &id).await?))
}

async fn delete_service_lb(
    State(s): Shared,
    Path((tenant, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    s.master.delete_service_lb(&name, &tenant).await?;
    Ok(StatusCode::NO_CONTENT)
}
