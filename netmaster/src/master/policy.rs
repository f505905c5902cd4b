//! Endpoint-group policies: which rules apply to which group, expanded
//! into one directional rule record per traffic direction.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use libresource::StateDriver;
use log::{error, info};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::mastercfg::{
    EpgPolicyState, PolicyRuleState, clear_record, endpoint_group_id, list_records, write_record,
};
use crate::objapi::model::{self, EndpointGroup, ModelObject, Network, Policy, Rule};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Epg policy exists")]
    EpgPolicyExists,
}

const ALL_DIRS: [&str; 4] = ["inRx", "inTx", "outRx", "outTx"];

/// `<epg key>:<policy key>`
pub fn epg_policy_key(epg: &EndpointGroup, policy: &Policy) -> String {
    format!("{}:{}", epg.key(), policy.key())
}

fn rule_dirs(rule: &Rule) -> &'static [&'static str] {
    let with_port = matches!(rule.protocol.as_str(), "tcp" | "udp") && rule.port != 0;
    match (rule.direction.as_str(), with_port) {
        ("in", true) => &["inRx", "inTx"],
        ("in", false) => &["inRx"],
        ("out", true) => &["outRx", "outTx"],
        ("out", false) => &["outTx"],
        ("both", true) => &ALL_DIRS,
        ("both", false) => &["inRx", "outTx"],
        _ => &[],
    }
}

fn ip_protocol(protocol: &str) -> u8 {
    match protocol {
        "tcp" => 6,
        "udp" => 17,
        "icmp" => 1,
        "igmp" => 2,
        "" => 0,
        other => other.parse::<u8>().unwrap_or(0),
    }
}

fn rule_record_id(epgp_key: &str, rule_key: &str, dir: &str) -> String {
    format!("{epgp_key}:{rule_key}:{dir}")
}

/// In-memory view of the attached policies, persisted as
/// [`EpgPolicyState`] records and reloaded on leadership.
pub struct PolicyManager {
    driver: Arc<dyn StateDriver>,
    db: Mutex<HashMap<String, EpgPolicyState>>,
}

impl PolicyManager {
    pub fn new(driver: Arc<dyn StateDriver>) -> Self {
        Self {
            driver,
            db: Mutex::new(HashMap::new()),
        }
    }

    pub async fn restore(&self) -> Result<()> {
        let records = list_records::<EpgPolicyState>(&self.driver).await?;
        let mut db = self.db.lock().await;
        db.clear();
        for gp in records {
            info!("Restoring EpgPolicy: {}", gp.id);
            db.insert(gp.id.clone(), gp);
        }
        Ok(())
    }

    pub async fn find(&self, epgp_key: &str) -> Option<EpgPolicyState> {
        self.db.lock().await.get(epgp_key).cloned()
    }

    /// Attaches `policy` with its `rules` to `epg`.
    pub async fn attach(&self, epg: &EndpointGroup, policy: &Policy, rules: &[Rule]) -> Result<()> {
        let key = epg_policy_key(epg, policy);
        let mut db = self.db.lock().await;
        if db.contains_key(&key) {
            error!("EPG policy {key} already exists");
            return Err(PolicyError::EpgPolicyExists.into());
        }

        let epg_id = endpoint_group_id(&self.driver, &epg.group_name, &epg.tenant_name)
            .await
            .inspect_err(|e| error!("Error getting epgID for {key}. Err: {e}"))?;

        info!("Creating new epg policy: {key}");
        let mut gp = EpgPolicyState {
            id: key.clone(),
            endpoint_group_id: epg_id,
            ..Default::default()
        };
        for rule in rules {
            info!("Adding Rule {} to epgp policy {key}", rule.key());
            self.add_rule(&mut gp, rule).await?;
        }
        write_record(&self.driver, &gp).await?;
        db.insert(key, gp);
        Ok(())
    }

    pub async fn detach(&self, epg: &EndpointGroup, policy: &Policy, rules: &[Rule]) -> Result<()> {
        let key = epg_policy_key(epg, policy);
        let mut db = self.db.lock().await;
        let Some(mut gp) = db.remove(&key) else {
            error!("Epg policy {key} does not exist");
            bail!("epg policy does not exist");
        };
        for rule in rules {
            info!("Deleting Rule {} from epgp policy {key}", rule.key());
            if let Err(e) = self.del_rule(&mut gp, rule).await {
                error!("Error deleting rule {} from epg policy {key}. Err: {e}", rule.key());
            }
        }
        clear_record::<EpgPolicyState>(&self.driver, &key).await?;
        Ok(())
    }

    /// Adds `rule` to the policy on each of the given endpoint groups.
    pub async fn policy_add_rule(
        &self,
        policy: &Policy,
        epg_keys: &[String],
        rule: &Rule,
    ) -> Result<()> {
        let mut db = self.db.lock().await;
        for epg_key in epg_keys {
            let key = format!("{epg_key}:{}", policy.key());
            let Some(gp) = db.get_mut(&key) else {
                error!("Failed to find the epg policy {key}");
                bail!("epg policy not found");
            };
            self.add_rule(gp, rule).await.inspect_err(|e| {
                error!("Error adding the rule {} to epg policy {key}. Err: {e}", rule.key())
            })?;
            write_record(&self.driver, &*gp).await?;
        }
        Ok(())
    }

    pub async fn policy_del_rule(
        &self,
        policy: &Policy,
        epg_keys: &[String],
        rule: &Rule,
    ) -> Result<()> {
        let mut db = self.db.lock().await;
        for epg_key in epg_keys {
            let key = format!("{epg_key}:{}", policy.key());
            let Some(gp) = db.get_mut(&key) else {
                error!("Failed to find the epg policy {key}");
                bail!("epg policy not found");
            };
            self.del_rule(gp, rule).await.inspect_err(|e| {
                error!("Error deleting the rule {} from epg policy {key}. Err: {e}", rule.key())
            })?;
            if let Err(e) = write_record(&self.driver, &*gp).await {
                error!("Error writing policy {key} to state store. Err: {e}");
            }
        }
        Ok(())
    }

    async fn add_rule(&self, gp: &mut EpgPolicyState, rule: &Rule) -> Result<()> {
        let rule_key = rule.key();
        if gp.rule_ids.contains(&rule_key) {
            bail!("Rule already exists");
        }
        for dir in rule_dirs(rule) {
            let record = self.directional_rule(gp, rule, dir).await.inspect_err(|e| {
                error!("Error creating {dir} rule for {rule_key}. Err: {e}")
            })?;
            write_record(&self.driver, &record).await?;
            info!("Added rule {} to policyDB", record.id);
        }
        gp.rule_ids.insert(rule_key);
        Ok(())
    }

    async fn del_rule(&self, gp: &mut EpgPolicyState, rule: &Rule) -> Result<()> {
        let rule_key = rule.key();
        if !gp.rule_ids.remove(&rule_key) {
            bail!("Rule does not exists");
        }
        for dir in ALL_DIRS {
            let id = rule_record_id(&gp.id, &rule_key, dir);
            if let Err(e) = clear_record::<PolicyRuleState>(&self.driver, &id).await {
                error!("Error deleting the rule {id}. Err: {e}");
            }
        }
        Ok(())
    }

    async fn network_subnet(&self, tenant: &str, network: &str, which: &str) -> Result<String> {
        let key = format!("{tenant}:{network}");
        let net: Network = model::find(&self.driver, &key)
            .await?
            .ok_or_else(|| {
                error!("Network {key} not found");
                anyhow!("{which} not found")
            })?;
        Ok(net.subnet)
    }

    async fn directional_rule(
        &self,
        gp: &EpgPolicyState,
        rule: &Rule,
        dir: &str,
    ) -> Result<PolicyRuleState> {
        let mut from_ip = rule.from_ip_address.clone();
        let mut to_ip = rule.to_ip_address.clone();
        let mut remote_epg = 0;

        let remote_group = if !rule.from_endpoint_group.is_empty() {
            Some(&rule.from_endpoint_group)
        } else if !rule.to_endpoint_group.is_empty() {
            Some(&rule.to_endpoint_group)
        } else {
            None
        };
        if let Some(group) = remote_group {
            match endpoint_group_id(&self.driver, group, &rule.tenant_name).await {
                Ok(id) => remote_epg = id,
                Err(e) => error!(
                    "Error finding endpoint group {group}/{}. Err: {e}",
                    rule.tenant_name
                ),
            }
        } else if !rule.from_network.is_empty() {
            from_ip = self
                .network_subnet(&rule.tenant_name, &rule.from_network, "FromNetwork")
                .await?;
        } else if !rule.to_network.is_empty() {
            to_ip = self
                .network_subnet(&rule.tenant_name, &rule.to_network, "ToNetwork")
                .await?;
        }

        let mut record = PolicyRuleState {
            id: rule_record_id(&gp.id, &rule.key(), dir),
            priority: rule.priority,
            ip_protocol: ip_protocol(&rule.protocol),
            action: rule.action.to_lowercase(),
            ..Default::default()
        };
        match dir {
            "inRx" => {
                record.dst_endpoint_group = gp.endpoint_group_id;
                record.src_endpoint_group = remote_epg;
                record.src_ip_addr = from_ip;
                record.dst_port = rule.port;
            }
            "inTx" => {
                record.src_endpoint_group = gp.endpoint_group_id;
                record.dst_endpoint_group = remote_epg;
                record.dst_ip_addr = from_ip;
                record.src_port = rule.port;
            }
            "outRx" => {
                record.dst_endpoint_group = gp.endpoint_group_id;
                record.src_endpoint_group = remote_epg;
                record.src_ip_addr = to_ip;
                record.src_port = rule.port;
            }
            "outTx" => {
                record.src_endpoint_group = gp.endpoint_group_id;
                record.dst_endpoint_group = remote_epg;
                record.dst_ip_addr = to_ip;
                record.dst_port = rule.port;
            }
            other => bail!("unknown rule direction {other}"),
        }
        Ok(record)
    }
}
