//! Reacts to object-model changes: validates them, drives the lifecycle
//! in [`NetMaster`], keeps the link table current and persists the object.
//!
//! Multi-step creates record a compensation for every completed step and
//! replay them if a later step fails.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use futures::FutureExt;
use lazy_static::lazy_static;
use libresource::bitset::create_bitset;
use libresource::{AUTO_EPG, ResourceConfig, ResourceError, ResourceValue, StateDriver};
use log::{error, info, warn};
use regex::Regex;

use super::links::LinkTable;
use super::model::{
    self, App, EndpointGroup, ModelObject, Network, Policy, Rule, Service, ServiceInstance,
    Tenant, Volume, VolumeProfile,
};
use super::undo::UndoStack;
use crate::config::ModelDefaults;
use crate::intent::{ConfigNetwork, ConfigTenant};
use crate::master::{NetMaster, PolicyError, network_id};
use crate::mastercfg::{EndpointGroupState, EndpointState, list_records, try_read_record};

/// Resource id of the cluster-wide endpoint-group id pool.
pub const GLOBAL_EPG_POOL: &str = "global";
const MAX_EPG_ID: usize = 65534;

pub const PRIVATE_NET: &str = "privateNet";
pub const PUBLIC_NET: &str = "publicNet";
pub const DEFAULT_VOLUME_PROFILE: &str = "default";

lazy_static! {
    // tenants and networks end up in dotted network ids
    static ref PLAIN_NAME: Regex = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$").unwrap();
    static ref DOTTED_NAME: Regex = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").unwrap();
}

fn check_plain_name(what: &str, name: &str) -> Result<()> {
    if !PLAIN_NAME.is_match(name) {
        bail!("Invalid {what} name");
    }
    Ok(())
}

fn check_dotted_name(what: &str, name: &str) -> Result<()> {
    if !DOTTED_NAME.is_match(name) {
        bail!("Invalid {what} name");
    }
    Ok(())
}

fn tenant_key(tenant: &str) -> String {
    tenant.to_string()
}

fn pair_key(tenant: &str, name: &str) -> String {
    format!("{tenant}:{name}")
}

fn validate_rule(rule: &Rule) -> Result<()> {
    match rule.direction.as_str() {
        "in" => {
            if !rule.to_network.is_empty() || !rule.to_endpoint_group.is_empty() {
                bail!("can not specify 'to' parameters in incoming rule");
            }
            if !rule.from_network.is_empty() && !rule.from_ip_address.is_empty() {
                bail!("can not specify both from network and from ip address");
            }
            if !rule.from_network.is_empty() && !rule.from_endpoint_group.is_empty() {
                bail!("can not specify both from network and from EndpointGroup");
            }
        }
        "out" => {
            if !rule.from_network.is_empty()
                || !rule.from_endpoint_group.is_empty()
                || !rule.from_ip_address.is_empty()
            {
                bail!("can not specify 'from' parameters in outgoing rule");
            }
            if !rule.to_network.is_empty() && !rule.to_ip_address.is_empty() {
                bail!("can not specify both to-network and to-ip address");
            }
            if !rule.to_network.is_empty() && !rule.to_endpoint_group.is_empty() {
                bail!("can not specify both to-network and to-EndpointGroup");
            }
        }
        _ => bail!("invalid direction for the rule"),
    }
    Ok(())
}

pub struct ObjController {
    driver: Arc<dyn StateDriver>,
    master: Arc<NetMaster>,
    links: LinkTable,
    defaults: ModelDefaults,
}

impl ObjController {
    /// Builds the controller and makes sure the endpoint-group id pool is
    /// defined.
    pub async fn new(master: Arc<NetMaster>, defaults: ModelDefaults) -> Result<Self> {
        let driver = Arc::clone(master.driver());
        let mut ids = create_bitset(16);
        ids.insert_range(1..MAX_EPG_ID + 1);
        match master
            .resource_manager()
            .define_resource(GLOBAL_EPG_POOL, AUTO_EPG, ResourceConfig::Epg(ids))
            .await
        {
            Ok(()) => info!("defined endpoint group id pool"),
            Err(ResourceError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            links: LinkTable::new(Arc::clone(&driver)),
            driver,
            master,
            defaults,
        })
    }

    pub fn master(&self) -> &Arc<NetMaster> {
        &self.master
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    async fn find<T: ModelObject>(&self, key: &str) -> Result<Option<T>> {
        model::find(&self.driver, key).await
    }

    async fn linked<F: ModelObject, T: ModelObject>(&self, from: &F) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for key in self.links.targets::<F, T>(from).await? {
            match self.find::<T>(&key).await? {
                Some(obj) => out.push(obj),
                None => warn!("dangling link {} {} -> {key}", F::KIND, from.key()),
            }
        }
        Ok(out)
    }

    async fn require_tenant(&self, name: &str) -> Result<Tenant> {
        if name.is_empty() {
            bail!("Invalid tenant name");
        }
        self.find::<Tenant>(&tenant_key(name))
            .await?
            .ok_or_else(|| anyhow!("Tenant not found"))
    }

    // Tenants

    /// Creates the tenant with its private and public networks and the
    /// default volume profile.
    pub async fn create_tenant(&self, tenant: &Tenant) -> Result<()> {
        info!("Received TenantCreate: {tenant:?}");
        check_plain_name("tenant", &tenant.tenant_name)?;
        if self.find::<Tenant>(&tenant.key()).await?.is_some() {
            info!("tenant {} already exists", tenant.tenant_name);
            return Ok(());
        }
        let mut undo = UndoStack::new();
        let res = self.create_tenant_steps(tenant, &mut undo).await;
        undo.finish(res).await
    }

    async fn create_tenant_steps<'a>(
        &'a self,
        tenant: &Tenant,
        undo: &mut UndoStack<'a>,
    ) -> Result<()> {
        let name = tenant.tenant_name.clone();
        self.master
            .create_tenant(&ConfigTenant {
                name: name.clone(),
                default_net_type: self.defaults.default_net_type.clone(),
                default_network: tenant.default_network.clone(),
                vlans: self.defaults.vlans.clone(),
                vxlans: self.defaults.vxlans.clone(),
                ..Default::default()
            })
            .await?;
        let t = name.clone();
        undo.push(
            format!("tenant state {name}"),
            async move { self.master.delete_tenant_id(&t).await }.boxed(),
        );

        model::save(&self.driver, tenant).await?;
        let t = tenant.clone();
        undo.push(
            format!("tenant {name}"),
            async move { model::remove::<Tenant>(&self.driver, &t.key()).await }.boxed(),
        );

        let defaults = [
            (PRIVATE_NET, "vxlan", "10.1.0.0/16", true),
            (PUBLIC_NET, "vlan", "192.168.1.0/24", false),
        ];
        for (net, encap, subnet, private) in defaults {
            let network = Network {
                tenant_name: name.clone(),
                network_name: net.to_string(),
                encap: encap.to_string(),
                subnet: subnet.to_string(),
                is_private: private,
                is_public: !private,
                ..Default::default()
            };
            self.create_network(&network).await.inspect_err(|e| {
                error!("Error creating {net} for tenant: {name}. Err: {e}")
            })?;
            let (t, n) = (name.clone(), net.to_string());
            undo.push(
                format!("network {net}"),
                async move { self.delete_network(&t, &n).await }.boxed(),
            );
        }

        let profile = VolumeProfile {
            tenant_name: name.clone(),
            volume_profile_name: DEFAULT_VOLUME_PROFILE.to_string(),
            datastore_type: "none".to_string(),
            ..Default::default()
        };
        self.create_volume_profile(&profile)
            .await
            .inspect_err(|e| error!("Error creating default volume profile. Err: {e}"))?;
        Ok(())
    }

    /// Deletes a tenant that carries nothing beyond its defaults.
    pub async fn delete_tenant(&self, name: &str) -> Result<()> {
        info!("Received TenantDelete: {name}");
        let tenant = self.require_tenant(name).await?;

        let apps = self.links.targets::<Tenant, App>(&tenant).await?;
        if !apps.is_empty() {
            bail!("cannot delete {name} has {} app profiles", apps.len());
        }
        let groups = self.links.targets::<Tenant, EndpointGroup>(&tenant).await?;
        if !groups.is_empty() {
            bail!("cannot delete {name} has {} endpoint groups", groups.len());
        }
        let policies = self.links.targets::<Tenant, Policy>(&tenant).await?;
        if !policies.is_empty() {
            bail!("cannot delete {name} has {} policies", policies.len());
        }
        let default_keys = [pair_key(name, PRIVATE_NET), pair_key(name, PUBLIC_NET)];
        let networks = self.links.targets::<Tenant, Network>(&tenant).await?;
        let user_networks = networks.iter().filter(|k| !default_keys.contains(k)).count();
        if user_networks != 0 {
            bail!("cannot delete {name} has {user_networks} networks");
        }

        for net in [PRIVATE_NET, PUBLIC_NET] {
            if self.find::<Network>(&pair_key(name, net)).await?.is_some() {
                self.delete_network(name, net).await?;
            }
        }
        for volume in self.linked::<Tenant, Volume>(&tenant).await? {
            self.links.unlink_all(&volume).await?;
            model::remove::<Volume>(&self.driver, &volume.key()).await?;
        }
        for profile in self.linked::<Tenant, VolumeProfile>(&tenant).await? {
            self.links.unlink_all(&profile).await?;
            model::remove::<VolumeProfile>(&self.driver, &profile.key()).await?;
        }

        if let Err(e) = self.master.delete_tenant_id(name).await {
            error!("Error deleting tenant {name}. Err: {e}");
        }
        self.links.unlink_all(&tenant).await?;
        model::remove::<Tenant>(&self.driver, &tenant.key()).await
    }

    // Networks

    pub async fn create_network(&self, network: &Network) -> Result<()> {
        info!("Received NetworkCreate: {network:?}");
        if let Some(existing) = self.find::<Network>(&network.key()).await? {
            return self.update_network(&existing, network).await;
        }
        check_plain_name("network", &network.network_name)?;
        let tenant = self.require_tenant(&network.tenant_name).await?;

        for other in self.linked::<Tenant, Network>(&tenant).await? {
            if !network.subnet.is_empty()
                && !other.subnet.is_empty()
                && libresource::netutils::is_overlapping_subnet(&network.subnet, &other.subnet)
            {
                error!("Overlapping of Networks");
                bail!(
                    "network {} conflicts with subnet {}",
                    other.network_name,
                    network.subnet
                );
            }
        }
        if let Some(clash) = self.find::<EndpointGroup>(&network.key()).await? {
            bail!(
                "EndpointGroup {} conflicts with the network name",
                clash.group_name
            );
        }

        let cfg = ConfigNetwork {
            name: network.network_name.clone(),
            nw_type: network.nw_type.clone(),
            pkt_tag_type: network.encap.clone(),
            pkt_tag: network.pkt_tag,
            subnet_cidr: network.subnet.clone(),
            gateway: network.gateway.clone(),
            ..Default::default()
        };
        self.master
            .create_network(&cfg, &network.tenant_name)
            .await
            .inspect_err(|e| error!("Error creating network {network:?}. Err: {e}"))?;

        model::save(&self.driver, network).await?;
        self.links.add(&tenant, network).await
    }

    pub async fn update_network(&self, network: &Network, params: &Network) -> Result<()> {
        info!("Received NetworkUpdate: {network:?}, params: {params:?}");
        bail!("Cant change network parameters after its created")
    }

    pub async fn delete_network(&self, tenant_name: &str, name: &str) -> Result<()> {
        info!("Received NetworkDelete: {tenant_name}:{name}");
        let tenant = self.require_tenant(tenant_name).await?;
        let network = self
            .find::<Network>(&pair_key(tenant_name, name))
            .await?
            .ok_or_else(|| anyhow!("Network {name} not found"))?;

        let groups = self.links.targets::<Network, EndpointGroup>(&network).await?;
        if !groups.is_empty() {
            bail!("cannot delete {name} has {} endpoint groups", groups.len());
        }
        let services = self.links.targets::<Network, Service>(&network).await?;
        if !services.is_empty() {
            bail!("cannot delete {name} has {} services ", services.len());
        }

        self.master
            .delete_network_id(&network_id(name, tenant_name))
            .await
            .inspect_err(|e| error!("Error deleting network {name}. Err: {e}"))?;
        self.links.remove(&tenant, &network).await?;
        self.links.unlink_all(&network).await?;
        model::remove::<Network>(&self.driver, &network.key()).await
    }

    // Endpoint groups

    async fn policy_rules(&self, policy: &Policy) -> Result<Vec<Rule>> {
        self.linked::<Policy, Rule>(policy).await
    }

    async fn require_policy(&self, tenant: &str, name: &str) -> Result<Policy> {
        self.find::<Policy>(&pair_key(tenant, name))
            .await?
            .ok_or_else(|| {
                error!("Could not find policy {name}");
                anyhow!("Policy not found")
            })
    }

    /// Creates the group, assigning it an id from the global pool. Returns
    /// the stored object.
    pub async fn create_endpoint_group(&self, epg: &EndpointGroup) -> Result<EndpointGroup> {
        info!("Received EndpointGroupCreate: {epg:?}");
        if let Some(existing) = self.find::<EndpointGroup>(&epg.key()).await? {
            return self.update_endpoint_group(&existing, epg).await;
        }
        check_dotted_name("endpoint group", &epg.group_name)?;
        let mut undo = UndoStack::new();
        let res = self.create_endpoint_group_steps(epg, &mut undo).await;
        undo.finish(res).await
    }

    async fn create_endpoint_group_steps<'a>(
        &'a self,
        epg: &EndpointGroup,
        undo: &mut UndoStack<'a>,
    ) -> Result<EndpointGroup> {
        let tenant = self.require_tenant(&epg.tenant_name).await?;
        let network = self
            .find::<Network>(&pair_key(&epg.tenant_name, &epg.network_name))
            .await?
            .ok_or_else(|| anyhow!("Network {} not found", epg.network_name))?;
        if let Some(clash) = self.find::<Network>(&epg.key()).await? {
            bail!(
                "Network {} conflicts with the endpointGroup name",
                clash.network_name
            );
        }

        let rm = self.master.resource_manager();
        let epg_id = rm
            .allocate_resource_val(GLOBAL_EPG_POOL, AUTO_EPG, 0)
            .await?
            .id()
            .ok_or_else(|| anyhow!("unexpected endpoint group id type"))?;
        undo.push(
            format!("endpoint group id {epg_id}"),
            async move {
                self.master
                    .resource_manager()
                    .deallocate_resource_val(GLOBAL_EPG_POOL, AUTO_EPG, ResourceValue::Id(epg_id))
                    .await?;
                Ok(())
            }
            .boxed(),
        );

        self.master
            .create_endpoint_group(&epg.tenant_name, &epg.network_name, &epg.group_name, epg_id)
            .await
            .inspect_err(|e| error!("Error creating endpoint group {epg:?}. Err: {e}"))?;
        let (t, g) = (epg.tenant_name.clone(), epg.group_name.clone());
        undo.push(
            format!("endpoint group state {g}"),
            async move { self.master.delete_endpoint_group(&t, &g).await }.boxed(),
        );

        let stored = EndpointGroup {
            endpoint_group_id: epg_id,
            ..epg.clone()
        };
        for policy_name in &stored.policies {
            let policy = self.require_policy(&stored.tenant_name, policy_name).await?;
            let rules = self.policy_rules(&policy).await?;
            self.master
                .policy()
                .attach(&stored, &policy, &rules)
                .await
                .inspect_err(|_| {
                    error!("Error attaching policy {policy_name} to epg {}", stored.key())
                })?;
            let (e, p) = (stored.clone(), policy.clone());
            undo.push(
                format!("policy {policy_name} attachment"),
                async move {
                    let rules = self.policy_rules(&p).await?;
                    self.master.policy().detach(&e, &p, &rules).await
                }
                .boxed(),
            );
            self.links.add(&policy, &stored).await?;
            let (e, p) = (stored.clone(), policy);
            undo.push(
                format!("link policy {policy_name}"),
                async move { self.links.remove(&p, &e).await }.boxed(),
            );
        }

        self.links.add(&network, &stored).await?;
        let e = stored.clone();
        undo.push(
            format!("link network {}", network.network_name),
            async move { self.links.remove(&network, &e).await }.boxed(),
        );
        self.links.add(&tenant, &stored).await?;
        let e = stored.clone();
        undo.push(
            format!("link tenant {}", tenant.tenant_name),
            async move { self.links.remove(&tenant, &e).await }.boxed(),
        );
        model::save(&self.driver, &stored).await?;
        Ok(stored)
    }

    /// Applies a new policy list to a group. The network cannot change.
    pub async fn update_endpoint_group(
        &self,
        epg: &EndpointGroup,
        params: &EndpointGroup,
    ) -> Result<EndpointGroup> {
        info!("Received EndpointGroupUpdate: {epg:?}, params: {params:?}");
        if epg.network_name != params.network_name {
            bail!("Cannot change network association after epg is created.");
        }

        for policy_name in params.policies.iter().filter(|p| !epg.policies.contains(p)) {
            let policy = self.require_policy(&epg.tenant_name, policy_name).await?;
            let rules = self.policy_rules(&policy).await?;
            if let Err(e) = self.master.policy().attach(epg, &policy, &rules).await {
                if e.downcast_ref::<PolicyError>().is_none() {
                    error!("Error attaching policy {policy_name} to epg {}", epg.key());
                    return Err(e);
                }
            }
            self.links.add(&policy, epg).await?;
        }

        for policy_name in epg.policies.iter().filter(|p| !params.policies.contains(p)) {
            let policy = self.require_policy(&epg.tenant_name, policy_name).await?;
            let rules = self.policy_rules(&policy).await?;
            self.master
                .policy()
                .detach(epg, &policy, &rules)
                .await
                .inspect_err(|_| {
                    error!("Error detaching policy {policy_name} from epg {}", epg.key())
                })?;
            self.links.remove(&policy, epg).await?;
        }

        let stored = EndpointGroup {
            policies: params.policies.clone(),
            ..epg.clone()
        };
        model::save(&self.driver, &stored).await?;
        Ok(stored)
    }

    pub async fn delete_endpoint_group(&self, tenant: &str, group: &str) -> Result<()> {
        info!("Received EndpointGroupDelete: {tenant}:{group}");
        let epg = self
            .find::<EndpointGroup>(&pair_key(tenant, group))
            .await?
            .ok_or_else(|| anyhow!("EndpointGroup {group} not found"))?;

        let state_key = crate::mastercfg::endpoint_group_key(group, tenant);
        let state = try_read_record::<EndpointGroupState>(&self.driver, &state_key).await?;
        if let Some(state) = state {
            if state.ep_count != 0 {
                bail!("Error: EPG {group} has active endpoints");
            }
        }

        for policy_name in &epg.policies {
            let Some(policy) = self.find::<Policy>(&pair_key(tenant, policy_name)).await? else {
                warn!("Could not find policy {policy_name}");
                continue;
            };
            let rules = self.policy_rules(&policy).await?;
            if let Err(e) = self.master.policy().detach(&epg, &policy, &rules).await {
                error!("Error detaching policy {policy_name} from epg {}: {e}", epg.key());
            }
        }

        self.master.delete_endpoint_group(tenant, group).await?;
        if epg.endpoint_group_id != 0 {
            self.master
                .resource_manager()
                .deallocate_resource_val(
                    GLOBAL_EPG_POOL,
                    AUTO_EPG,
                    ResourceValue::Id(epg.endpoint_group_id),
                )
                .await?;
        }
        self.links.unlink_all(&epg).await?;
        model::remove::<EndpointGroup>(&self.driver, &epg.key()).await
    }

    // Policies and rules

    pub async fn create_policy(&self, policy: &Policy) -> Result<()> {
        info!("Received PolicyCreate: {policy:?}");
        check_dotted_name("policy", &policy.policy_name)?;
        let tenant = self
            .require_tenant(&policy.tenant_name)
            .await
            .map_err(|_| anyhow!("Tenant {} not found", policy.tenant_name))?;
        model::save(&self.driver, policy).await?;
        self.links.add(&tenant, policy).await
    }

    /// Deletes a policy that no group uses, together with its rules.
    pub async fn delete_policy(&self, tenant: &str, name: &str) -> Result<()> {
        info!("Received PolicyDelete: {tenant}:{name}");
        let policy = self.require_policy(tenant, name).await?;
        if !self
            .links
            .targets::<Policy, EndpointGroup>(&policy)
            .await?
            .is_empty()
        {
            bail!("Policy is being used");
        }

        for rule in self.policy_rules(&policy).await? {
            if let Err(e) = self
                .delete_rule(&rule.tenant_name, &rule.policy_name, &rule.rule_id)
                .await
            {
                error!("Error deleting the rule: {}. Err: {e}", rule.key());
            }
        }
        self.links.unlink_all(&policy).await?;
        model::remove::<Policy>(&self.driver, &policy.key()).await
    }

    async fn rule_group(&self, rule: &Rule) -> Result<Option<EndpointGroup>> {
        let group = if !rule.from_endpoint_group.is_empty() {
            &rule.from_endpoint_group
        } else if !rule.to_endpoint_group.is_empty() {
            &rule.to_endpoint_group
        } else {
            if !rule.from_network.is_empty() {
                self.find::<Network>(&pair_key(&rule.tenant_name, &rule.from_network))
                    .await?
                    .ok_or_else(|| anyhow!("from Network not found"))?;
            } else if !rule.to_network.is_empty() {
                self.find::<Network>(&pair_key(&rule.tenant_name, &rule.to_network))
                    .await?
                    .ok_or_else(|| anyhow!("to Network not found"))?;
            }
            return Ok(None);
        };
        let key = pair_key(&rule.tenant_name, group);
        let epg = self.find::<EndpointGroup>(&key).await?.ok_or_else(|| {
            error!("Error finding endpoint group {key}");
            anyhow!("endpoint group not found")
        })?;
        Ok(Some(epg))
    }

    /// An incoming rule naming a destination address only makes sense when
    /// the policy is on exactly one group and that group owns the address.
    async fn check_rule_destination(&self, rule: &Rule, epg_keys: &[String]) -> Result<()> {
        if rule.direction != "in" || rule.to_ip_address.is_empty() {
            return Ok(());
        }
        let [epg_key] = epg_keys else {
            bail!(
                "failed to configure {}, {} endpoint groups linked to policy {} ",
                rule.to_ip_address,
                epg_keys.len(),
                rule.policy_name
            );
        };
        let group = epg_key
            .strip_prefix(&format!("{}:", rule.tenant_name))
            .unwrap_or(epg_key);
        let state_key = crate::mastercfg::endpoint_group_key(group, &rule.tenant_name);
        let eps = list_records::<EndpointState>(&self.driver).await?;
        if !eps
            .iter()
            .any(|ep| ep.ip_address == rule.to_ip_address && ep.endpoint_group_key == state_key)
        {
            bail!(
                "failed to configure {}, ip address is not in epg {state_key}",
                rule.to_ip_address
            );
        }
        Ok(())
    }

    pub async fn create_rule(&self, rule: &Rule) -> Result<()> {
        info!("Received RuleCreate: {rule:?}");
        if let Some(existing) = self.find::<Rule>(&rule.key()).await? {
            return self.update_rule(&existing, rule).await;
        }
        validate_rule(rule)?;
        let epg = self.rule_group(rule).await?;
        let policy = self.require_policy(&rule.tenant_name, &rule.policy_name).await?;
        let epg_keys = self.links.targets::<Policy, EndpointGroup>(&policy).await?;
        self.check_rule_destination(rule, &epg_keys).await?;

        self.master
            .policy()
            .policy_add_rule(&policy, &epg_keys, rule)
            .await
            .inspect_err(|e| {
                error!("Error adding rule {} to policy {}. Err: {e}", rule.key(), policy.key())
            })?;

        model::save(&self.driver, rule).await?;
        self.links.add(&policy, rule).await?;
        if let Some(epg) = epg {
            self.links.add(&epg, rule).await?;
        }
        Ok(())
    }

    pub async fn update_rule(&self, rule: &Rule, params: &Rule) -> Result<()> {
        info!("Received RuleUpdate: {rule:?}, params: {params:?}");
        bail!("can not update a rule after its created")
    }

    pub async fn delete_rule(&self, tenant: &str, policy_name: &str, rule_id: &str) -> Result<()> {
        info!("Received RuleDelete: {tenant}:{policy_name}:{rule_id}");
        let key = format!("{tenant}:{policy_name}:{rule_id}");
        let rule = self
            .find::<Rule>(&key)
            .await?
            .ok_or_else(|| anyhow!("Rule {key} not found"))?;
        let policy = self.require_policy(tenant, policy_name).await?;
        let epg_keys = self.links.targets::<Policy, EndpointGroup>(&policy).await?;

        self.master
            .policy()
            .policy_del_rule(&policy, &epg_keys, &rule)
            .await
            .inspect_err(|e| {
                error!("Error deleting rule {key} to policy {}. Err: {e}", policy.key())
            })?;
        self.links.unlink_all(&rule).await?;
        model::remove::<Rule>(&self.driver, &key).await
    }

    // Apps, services and volumes

    pub async fn create_app(&self, app: &App) -> Result<()> {
        info!("Received AppCreate: {app:?}");
        check_dotted_name("app", &app.app_name)?;
        let tenant = self.require_tenant(&app.tenant_name).await?;
        model::save(&self.driver, app).await?;
        self.links.add(&tenant, app).await
    }

    pub async fn delete_app(&self, tenant: &str, name: &str) -> Result<()> {
        info!("Received AppDelete: {tenant}:{name}");
        let app = self
            .find::<App>(&pair_key(tenant, name))
            .await?
            .ok_or_else(|| anyhow!("App not found"))?;
        let services = self.links.targets::<App, Service>(&app).await?;
        if !services.is_empty() {
            bail!("cannot delete {name} has {} services", services.len());
        }
        self.links.unlink_all(&app).await?;
        model::remove::<App>(&self.driver, &app.key()).await
    }

    /// Creates a service of an app: links it to its networks, creates one
    /// default group per network when none are named, and scales out the
    /// instances with their volumes.
    pub async fn create_service(&self, service: &Service) -> Result<Service> {
        info!("Received ServiceCreate: {service:?}");
        if service.tenant_name.is_empty() || service.app_name.is_empty() {
            bail!("Invalid parameters");
        }
        check_dotted_name("service", &service.service_name)?;
        let mut undo = UndoStack::new();
        let res = self.create_service_steps(service, &mut undo).await;
        undo.finish(res).await
    }

    async fn create_service_steps<'a>(
        &'a self,
        service: &Service,
        undo: &mut UndoStack<'a>,
    ) -> Result<Service> {
        let mut service = service.clone();
        self.require_tenant(&service.tenant_name).await?;
        let app = self
            .find::<App>(&pair_key(&service.tenant_name, &service.app_name))
            .await?
            .ok_or_else(|| anyhow!("App not found"))?;

        if service.networks.is_empty() {
            service.networks.push(PRIVATE_NET.to_string());
        }
        if service.volume_profile.is_empty() {
            service.volume_profile = DEFAULT_VOLUME_PROFILE.to_string();
        }
        if service.scale == 0 {
            service.scale = 1;
        }

        let mut networks = Vec::new();
        for net_name in &service.networks {
            let key = pair_key(&service.tenant_name, net_name);
            let network = self.find::<Network>(&key).await?.ok_or_else(|| {
                error!("Service: {} could not find network {key}", service.key());
                anyhow!("Network not found")
            })?;
            networks.push(network);
        }

        if service.endpoint_groups.is_empty() {
            for net_name in service.networks.clone() {
                let group_name =
                    format!("{}.{}.{net_name}", service.app_name, service.service_name);
                let epg = EndpointGroup {
                    tenant_name: service.tenant_name.clone(),
                    group_name: group_name.clone(),
                    network_name: net_name,
                    ..Default::default()
                };
                self.create_endpoint_group(&epg).await.inspect_err(|e| {
                    error!("Error creating endpoint group: {epg:?}, Err: {e}")
                })?;
                let t = service.tenant_name.clone();
                let g = group_name.clone();
                undo.push(
                    format!("endpoint group {group_name}"),
                    async move { self.delete_endpoint_group(&t, &g).await }.boxed(),
                );
                service.endpoint_groups.push(group_name);
            }
        }
        let mut groups = Vec::new();
        for group_name in &service.endpoint_groups {
            let epg = self
                .find::<EndpointGroup>(&pair_key(&service.tenant_name, group_name))
                .await?
                .ok_or_else(|| {
                    error!("Error: could not find endpoint group: {group_name}");
                    anyhow!("could not find endpointGroup")
                })?;
            groups.push(epg);
        }

        let profile = self
            .find::<VolumeProfile>(&pair_key(&service.tenant_name, &service.volume_profile))
            .await?
            .ok_or_else(|| {
                error!("Could not find the volume profile: {}", service.volume_profile);
                anyhow!("VolumeProfile not found")
            })?;

        model::save(&self.driver, &service).await?;
        let saved = service.clone();
        undo.push(
            format!("service {}", service.key()),
            async move {
                self.links.unlink_all(&saved).await?;
                model::remove::<Service>(&self.driver, &saved.key()).await
            }
            .boxed(),
        );
        self.links.add(&app, &service).await?;
        for network in &networks {
            self.links.add(network, &service).await?;
        }
        for epg in &groups {
            self.links.add(epg, &service).await?;
        }

        for idx in 1..=service.scale {
            let instance_id = idx.to_string();
            let mut volumes = Vec::new();
            if profile.datastore_type != "none" {
                let volume_name =
                    format!("{}.{}.{instance_id}", service.app_name, service.service_name);
                let volume = Volume {
                    tenant_name: service.tenant_name.clone(),
                    volume_name: volume_name.clone(),
                    datastore_type: profile.datastore_type.clone(),
                    pool_name: profile.pool_name.clone(),
                    size: profile.size.clone(),
                    mount_point: profile.mount_point.clone(),
                };
                self.create_volume(&volume).await.inspect_err(|e| {
                    error!("Error creating volume {volume_name}. Err: {e}")
                })?;
                undo.push(
                    format!("volume {volume_name}"),
                    async move {
                        self.links.unlink_all(&volume).await?;
                        model::remove::<Volume>(&self.driver, &volume.key()).await
                    }
                    .boxed(),
                );
                volumes.push(volume_name);
            }

            let inst = ServiceInstance {
                tenant_name: service.tenant_name.clone(),
                app_name: service.app_name.clone(),
                service_name: service.service_name.clone(),
                instance_id,
                volumes,
            };
            self.create_service_instance(&inst).await.inspect_err(|e| {
                error!("Error creating service instance: {inst:?}. Err: {e}")
            })?;
            undo.push(
                format!("service instance {}", inst.key()),
                async move {
                    self.links.unlink_all(&inst).await?;
                    model::remove::<ServiceInstance>(&self.driver, &inst.key()).await
                }
                .boxed(),
            );
        }
        Ok(service)
    }

    /// Removes a service with its instances, their volumes and the default
    /// groups created for it.
    pub async fn delete_service(&self, tenant: &str, app: &str, name: &str) -> Result<()> {
        info!("Received ServiceDelete: {tenant}:{app}:{name}");
        let key = format!("{tenant}:{app}:{name}");
        let service = self
            .find::<Service>(&key)
            .await?
            .ok_or_else(|| anyhow!("Service not found"))?;

        for inst in self.linked::<Service, ServiceInstance>(&service).await? {
            for volume in self.linked::<ServiceInstance, Volume>(&inst).await? {
                self.links.unlink_all(&volume).await?;
                model::remove::<Volume>(&self.driver, &volume.key()).await?;
            }
            self.links.unlink_all(&inst).await?;
            model::remove::<ServiceInstance>(&self.driver, &inst.key()).await?;
        }

        self.links.unlink_all(&service).await?;
        let default_prefix = format!("{app}.{name}.");
        for group in &service.endpoint_groups {
            if group.starts_with(&default_prefix) {
                if let Err(e) = self.delete_endpoint_group(tenant, group).await {
                    error!("Error deleting endpoint group {group}. Err: {e}");
                }
            }
        }
        model::remove::<Service>(&self.driver, &key).await
    }

    pub async fn create_service_instance(&self, inst: &ServiceInstance) -> Result<()> {
        info!("Received ServiceInstanceCreate: {inst:?}");
        let service_key = format!("{}:{}:{}", inst.tenant_name, inst.app_name, inst.service_name);
        let service = self.find::<Service>(&service_key).await?.ok_or_else(|| {
            error!("Service {service_key} not found for instance: {inst:?}");
            anyhow!("Service not found")
        })?;

        let mut volumes = Vec::new();
        for volume_name in &inst.volumes {
            let volume = self
                .find::<Volume>(&pair_key(&inst.tenant_name, volume_name))
                .await?
                .ok_or_else(|| {
                    error!("Could not find volume {volume_name} for service: {}", inst.key());
                    anyhow!("Could not find the volume")
                })?;
            volumes.push(volume);
        }

        model::save(&self.driver, inst).await?;
        self.links.add(&service, inst).await?;
        for volume in &volumes {
            self.links.add(inst, volume).await?;
        }
        Ok(())
    }

    pub async fn create_volume(&self, volume: &Volume) -> Result<()> {
        info!("Received VolumeCreate: {volume:?}");
        let tenant = self.require_tenant(&volume.tenant_name).await?;
        model::save(&self.driver, volume).await?;
        self.links.add(&tenant, volume).await
    }

    pub async fn create_volume_profile(&self, profile: &VolumeProfile) -> Result<()> {
        info!("Received VolumeProfileCreate: {profile:?}");
        let tenant = self.require_tenant(&profile.tenant_name).await?;
        model::save(&self.driver, profile).await?;
        self.links.add(&tenant, profile).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mastercfg::{EpgPolicyState, NetworkState, read_record};
    use libresource::{FakeStateDriver, StateResourceManager};
    use serial_test::serial;

    async fn controller() -> ObjController {
        let rm = StateResourceManager::new(Arc::new(FakeStateDriver::new())).unwrap();
        let nm = Arc::new(NetMaster::new(Arc::new(rm)));
        let ctrl = ObjController::new(nm, ModelDefaults::default()).await.unwrap();
        ctrl.create_tenant(&Tenant {
            tenant_name: "t1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        ctrl
    }

    fn epg(group: &str, policies: &[&str]) -> EndpointGroup {
        EndpointGroup {
            tenant_name: "t1".into(),
            group_name: group.into(),
            network_name: PRIVATE_NET.into(),
            policies: policies.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn rule_validation() {
        let mut rule = Rule {
            direction: "in".into(),
            to_network: "n".into(),
            ..Default::default()
        };
        assert_eq!(
            validate_rule(&rule).unwrap_err().to_string(),
            "can not specify 'to' parameters in incoming rule"
        );
        rule.direction = "out".into();
        rule.from_ip_address = "1.1.1.1".into();
        assert_eq!(
            validate_rule(&rule).unwrap_err().to_string(),
            "can not specify 'from' parameters in outgoing rule"
        );
        rule.direction = "both".into();
        assert_eq!(
            validate_rule(&rule).unwrap_err().to_string(),
            "invalid direction for the rule"
        );
        assert!(check_plain_name("tenant", "a.b").is_err());
        assert!(check_dotted_name("group", "app.web.privateNet").is_ok());
    }

    #[tokio::test]
    #[serial]
    async fn tenant_defaults_and_delete_guards() {
        let ctrl = controller().await;
        let d = ctrl.master().driver();
        let private: NetworkState = read_record(d, "privateNet.t1").await.unwrap();
        assert_eq!(private.pkt_tag_type, "vxlan");
        assert_eq!(private.subnet_cidr(), "10.1.0.0/16");
        let public: NetworkState = read_record(d, "publicNet.t1").await.unwrap();
        assert_eq!(public.pkt_tag_type, "vlan");
        assert!(
            ctrl.find::<VolumeProfile>("t1:default")
                .await
                .unwrap()
                .is_some()
        );

        let overlap = Network {
            tenant_name: "t1".into(),
            network_name: "inner".into(),
            encap: "vlan".into(),
            subnet: "10.1.2.0/24".into(),
            ..Default::default()
        };
        assert_eq!(
            ctrl.create_network(&overlap).await.unwrap_err().to_string(),
            "network privateNet conflicts with subnet 10.1.2.0/24"
        );
        let extra = Network {
            subnet: "20.1.2.0/24".into(),
            ..overlap
        };
        ctrl.create_network(&extra).await.unwrap();
        assert_eq!(
            ctrl.create_network(&extra).await.unwrap_err().to_string(),
            "Cant change network parameters after its created"
        );
        assert_eq!(
            ctrl.delete_tenant("t1").await.unwrap_err().to_string(),
            "cannot delete t1 has 1 networks"
        );

        ctrl.delete_network("t1", "inner").await.unwrap();
        ctrl.delete_tenant("t1").await.unwrap();
        assert!(ctrl.find::<Tenant>("t1").await.unwrap().is_none());
        assert!(
            try_read_record::<NetworkState>(d, "privateNet.t1")
                .await
                .unwrap()
                .is_none()
        );

        ctrl.create_tenant(&Tenant {
            tenant_name: "t1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn groups_policies_and_rules() {
        let ctrl = controller().await;
        let policy = Policy {
            tenant_name: "t1".into(),
            policy_name: "pol".into(),
        };
        ctrl.create_policy(&policy).await.unwrap();
        let rule = Rule {
            tenant_name: "t1".into(),
            policy_name: "pol".into(),
            rule_id: "1".into(),
            direction: "in".into(),
            protocol: "tcp".into(),
            port: 80,
            action: "allow".into(),
            ..Default::default()
        };
        ctrl.create_rule(&rule).await.unwrap();

        assert_eq!(
            ctrl.create_endpoint_group(&epg("web", &["missing"]))
                .await
                .unwrap_err()
                .to_string(),
            "Policy not found"
        );
        // a later missing policy unwinds the attachment and link of an earlier one
        assert_eq!(
            ctrl.create_endpoint_group(&epg("web", &["pol", "missing"]))
                .await
                .unwrap_err()
                .to_string(),
            "Policy not found"
        );
        assert!(ctrl.master().policy().find("t1:web:t1:pol").await.is_none());
        assert!(
            ctrl.links()
                .targets::<Policy, EndpointGroup>(&policy)
                .await
                .unwrap()
                .is_empty()
        );
        // the failed creates handed their ids back
        let web = ctrl.create_endpoint_group(&epg("web", &["pol"])).await.unwrap();
        assert_eq!(web.endpoint_group_id, 1);
        let gp: EpgPolicyState = read_record(ctrl.master().driver(), "t1:web:t1:pol")
            .await
            .unwrap();
        assert!(gp.rule_ids.contains("t1:pol:1"));

        assert_eq!(
            ctrl.delete_policy("t1", "pol").await.unwrap_err().to_string(),
            "Policy is being used"
        );

        let mut moved = epg("web", &[]);
        moved.network_name = PUBLIC_NET.into();
        assert_eq!(
            ctrl.create_endpoint_group(&moved).await.unwrap_err().to_string(),
            "Cannot change network association after epg is created."
        );
        let web = ctrl.create_endpoint_group(&epg("web", &[])).await.unwrap();
        assert!(web.policies.is_empty());
        assert!(ctrl.master().policy().find("t1:web:t1:pol").await.is_none());

        ctrl.delete_policy("t1", "pol").await.unwrap();
        assert!(ctrl.find::<Rule>("t1:pol:1").await.unwrap().is_none());
        let db = ctrl.create_endpoint_group(&epg("db", &[])).await.unwrap();
        assert_eq!(db.endpoint_group_id, 2);
        ctrl.delete_endpoint_group("t1", "web").await.unwrap();
        let api = ctrl.create_endpoint_group(&epg("api", &[])).await.unwrap();
        assert_eq!(api.endpoint_group_id, 1);
    }

    #[tokio::test]
    #[serial]
    async fn failed_group_leaves_policy_deletable() {
        let ctrl = controller().await;
        let policy = Policy {
            tenant_name: "t1".into(),
            policy_name: "pol".into(),
        };
        ctrl.create_policy(&policy).await.unwrap();
        assert!(
            ctrl.create_endpoint_group(&epg("web", &["pol", "missing"]))
                .await
                .is_err()
        );
        assert!(ctrl.find::<EndpointGroup>("t1:web").await.unwrap().is_none());
        ctrl.delete_policy("t1", "pol").await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn services_scale_out_and_unwind() {
        let ctrl = controller().await;
        ctrl.create_app(&App {
            tenant_name: "t1".into(),
            app_name: "shop".into(),
        })
        .await
        .unwrap();

        let svc = ctrl
            .create_service(&Service {
                tenant_name: "t1".into(),
                app_name: "shop".into(),
                service_name: "web".into(),
                scale: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(svc.endpoint_groups, vec!["shop.web.privateNet".to_string()]);
        assert!(
            ctrl.find::<ServiceInstance>("t1:shop:web:2")
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(
            ctrl.delete_app("t1", "shop").await.unwrap_err().to_string(),
            "cannot delete shop has 1 services"
        );

        // unknown profile: the default group created for it is unwound
        let err = ctrl
            .create_service(&Service {
                tenant_name: "t1".into(),
                app_name: "shop".into(),
                service_name: "db".into(),
                volume_profile: "fast".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "VolumeProfile not found");
        assert!(
            ctrl.find::<EndpointGroup>("t1:shop.db.privateNet")
                .await
                .unwrap()
                .is_none()
        );

        ctrl.delete_service("t1", "shop", "web").await.unwrap();
        assert!(
            ctrl.find::<EndpointGroup>("t1:shop.web.privateNet")
                .await
                .unwrap()
                .is_none()
        );
        ctrl.delete_app("t1", "shop").await.unwrap();
        ctrl.delete_tenant("t1").await.unwrap();
    }
}
