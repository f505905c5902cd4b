//! Operator tool for inspecting and seeding tag pools and for reading or
//! patching persisted state records in place.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use libresource::{StateDriver, StateResourceManager};
use log::{error, info};
use serde_json::Value;

use crate::gstate::Cfg;
use crate::mastercfg::{
    EndpointGroupState, EndpointState, EpgPolicyState, HostState, NetworkState, PolicyRuleState,
    ServiceLbState, StateRecord, SvcProviderState, read_record, write_record,
};

/// What one cfgtool invocation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfgRequest {
    Resource {
        kind: String,
        tenant: String,
        set: Option<String>,
    },
    State {
        name: String,
        id: String,
        field: Option<String>,
        set: Option<String>,
    },
}

impl CfgRequest {
    /// Builds a request from the command-line flags.
    pub fn from_flags(
        resource: Option<String>,
        tenant: String,
        state: Option<String>,
        id: Option<String>,
        field: Option<String>,
        set: Option<String>,
    ) -> Result<Self> {
        match (resource, state) {
            (Some(kind), None) => Ok(CfgRequest::Resource { kind, tenant, set }),
            (None, Some(name)) => {
                let id = id.ok_or_else(|| anyhow!("--state requires --id"))?;
                if set.is_some() && field.is_none() {
                    bail!("--set on a state record requires --field");
                }
                Ok(CfgRequest::State {
                    name,
                    id,
                    field,
                    set,
                })
            }
            (Some(_), Some(_)) => bail!("--resource and --state are mutually exclusive"),
            (None, None) => bail!("one of --resource or --state is required"),
        }
    }
}

pub async fn run<W: Write>(rm: &StateResourceManager, req: &CfgRequest, out: &mut W) -> Result<()> {
    match req {
        CfgRequest::Resource { kind, tenant, set } => {
            process_resource(rm, tenant, kind, set.as_deref(), out).await
        }
        CfgRequest::State {
            name,
            id,
            field,
            set,
        } => {
            let driver = rm.driver();
            let patch = field.as_deref().zip(set.as_deref());
            process_state(&driver, name, id, patch, out).await
        }
    }
}

/// Prints the tags in use and, with `set`, marks every value of the range
/// as allocated.
pub async fn process_resource<W: Write>(
    rm: &StateResourceManager,
    tenant: &str,
    kind: &str,
    set: Option<&str>,
    out: &mut W,
) -> Result<()> {
    let gc = Cfg::read(&rm.driver(), tenant)
        .await
        .with_context(|| format!("Error reading tenant config for {tenant}"))?;

    let (num, in_use) = match kind {
        "vlan" => gc.get_vlans_in_use(rm).await,
        "vxlan" => gc.get_vxlans_in_use(rm).await,
        other => bail!("Unknown resource {other}"),
    };
    writeln!(out, "Num {kind}s: {num}")?;
    writeln!(out, "Current {kind}s in Use: {in_use}")?;

    let Some(range) = set else {
        return Ok(());
    };
    for value in parse_range(range)? {
        let res = match kind {
            "vlan" => gc.alloc_vlan(rm, value).await.map(|_| ()),
            _ => gc.alloc_vxlan(rm, value).await.map(|_| ()),
        };
        match res {
            Ok(()) => info!("marked {kind} {value} as in use"),
            Err(e) => error!("Error setting {kind} {value}: {e:#}"),
        }
    }
    Ok(())
}

/// Expands `"1,4-6"` into every value it names.
pub fn parse_range(range: &str) -> Result<Vec<u32>> {
    let mut values = Vec::new();
    for item in range.split(',') {
        let bounds: Vec<&str> = item.split('-').collect();
        let parsed = bounds
            .iter()
            .map(|b| b.trim().parse::<u32>())
            .collect::<Result<Vec<u32>, _>>()
            .map_err(|_| anyhow!("invalid range values {item:?}"))?;
        match parsed.as_slice() {
            [v] => values.push(*v),
            [lo, hi] if lo <= hi => values.extend(*lo..=*hi),
            _ => bail!("invalid range format {item:?}"),
        }
    }
    Ok(values)
}

/// Prints a persisted record and, when `patch` names a field and value,
/// rewrites that field.
pub async fn process_state<W: Write>(
    driver: &Arc<dyn StateDriver>,
    name: &str,
    id: &str,
    patch: Option<(&str, &str)>,
    out: &mut W,
) -> Result<()> {
    match name {
        "NetworkState" => show_or_patch::<NetworkState, W>(driver, id, patch, out).await,
        "EndpointState" => show_or_patch::<EndpointState, W>(driver, id, patch, out).await,
        "EndpointGroupState" => {
            show_or_patch::<EndpointGroupState, W>(driver, id, patch, out).await
        }
        "EpgPolicyState" => show_or_patch::<EpgPolicyState, W>(driver, id, patch, out).await,
        "PolicyRuleState" => show_or_patch::<PolicyRuleState, W>(driver, id, patch, out).await,
        "ServiceLbState" => show_or_patch::<ServiceLbState, W>(driver, id, patch, out).await,
        "SvcProviderState" => show_or_patch::<SvcProviderState, W>(driver, id, patch, out).await,
        "HostState" => show_or_patch::<HostState, W>(driver, id, patch, out).await,
        other => bail!("Unknown state type {other}"),
    }
}

async fn show_or_patch<T: StateRecord, W: Write>(
    driver: &Arc<dyn StateDriver>,
    id: &str,
    patch: Option<(&str, &str)>,
    out: &mut W,
) -> Result<()> {
    let rec: T = read_record(driver, id)
        .await
        .with_context(|| format!("Error reading state {id}"))?;
    let mut value = serde_json::to_value(&rec)?;
    writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;

    let Some((field, raw)) = patch else {
        return Ok(());
    };
    set_field(&mut value, field, raw)?;
    let patched: T = serde_json::from_value(value)
        .with_context(|| format!("field {field} does not accept {raw:?}"))?;
    write_record(driver, &patched)
        .await
        .with_context(|| format!("Error writing state {id}"))?;
    info!("set {field} of {} to {raw}", T::key_for(id));
    Ok(())
}

/// Replaces one scalar field, keeping its JSON kind.
fn set_field(value: &mut Value, field: &str, raw: &str) -> Result<()> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("state is not a struct"))?;
    let slot = obj
        .get_mut(field)
        .ok_or_else(|| anyhow!("could not find the field {field}"))?;
    let new = match &*slot {
        Value::String(_) => Value::String(raw.to_string()),
        Value::Bool(_) => Value::Bool(
            raw.parse()
                .with_context(|| format!("Can not convert {raw} to bool"))?,
        ),
        Value::Number(n) if n.is_u64() => Value::from(
            raw.parse::<u64>()
                .with_context(|| format!("Can not convert {raw} to uint"))?,
        ),
        Value::Number(n) if n.is_i64() => Value::from(
            raw.parse::<i64>()
                .with_context(|| format!("Can not convert {raw} to int"))?,
        ),
        _ => bail!("invalid kind for field {field}"),
    };
    *slot = new;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gstate::{AutoParams, ResKind};
    use libresource::FakeStateDriver;
    use serial_test::serial;

    #[test]
    fn ranges_expand() {
        assert_eq!(parse_range("5").unwrap(), vec![5]);
        assert_eq!(parse_range("1,3-5").unwrap(), vec![1, 3, 4, 5]);
        let err = parse_range("1-x").unwrap_err();
        assert!(err.to_string().contains("invalid range values"));
        let err = parse_range("1-2-3").unwrap_err();
        assert!(err.to_string().contains("invalid range format"));
        assert!(parse_range("9-3").is_err());
    }

    #[test]
    fn flags_pick_one_mode() {
        let r = CfgRequest::from_flags(
            Some("vlan".into()),
            "default".into(),
            None,
            None,
            None,
            Some("1-3".into()),
        )
        .unwrap();
        assert!(matches!(r, CfgRequest::Resource { ref kind, .. } if kind == "vlan"));

        let no_id = CfgRequest::from_flags(
            None,
            "default".into(),
            Some("HostState".into()),
            None,
            None,
            None,
        );
        assert!(no_id.is_err());
        assert!(
            CfgRequest::from_flags(
                None,
                "default".into(),
                Some("HostState".into()),
                Some("h1".into()),
                None,
                Some("x".into()),
            )
            .is_err()
        );
        assert!(CfgRequest::from_flags(None, "default".into(), None, None, None, None).is_err());
    }

    #[tokio::test]
    #[serial]
    async fn resource_listing_and_seeding() {
        let rm = StateResourceManager::new(Arc::new(FakeStateDriver::new())).unwrap();
        let gc = Cfg {
            tenant: "default".into(),
            auto: AutoParams {
                vlans: "1-20".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        gc.write(&rm.driver()).await.unwrap();
        gc.process(&rm, ResKind::Vlan).await.unwrap();

        let req = CfgRequest::Resource {
            kind: "vlan".into(),
            tenant: "default".into(),
            set: Some("2,5-6".into()),
        };
        let mut out = Vec::new();
        run(&rm, &req, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Num vlans: 0"));
        assert_eq!(gc.get_vlans_in_use(&rm).await, (3, "2, 5-6".to_string()));

        let mut out = Vec::new();
        process_resource(&rm, "default", "vlan", None, &mut out)
            .await
            .unwrap();
        assert!(String::from_utf8(out).unwrap().contains("Current vlans in Use: 2, 5-6"));

        let mut out = Vec::new();
        assert!(
            process_resource(&rm, "default", "epg", None, &mut out)
                .await
                .is_err()
        );
        rm.release().unwrap();
    }

    #[tokio::test]
    async fn state_fields_are_patched_by_kind() {
        let driver: Arc<dyn StateDriver> = Arc::new(FakeStateDriver::new());
        let net = NetworkState {
            id: "orange.t1".into(),
            tenant: "t1".into(),
            pkt_tag: 12,
            ..Default::default()
        };
        write_record(&driver, &net).await.unwrap();

        let mut out = Vec::new();
        process_state(&driver, "NetworkState", "orange.t1", None, &mut out)
            .await
            .unwrap();
        assert!(String::from_utf8(out).unwrap().contains("\"pktTag\": 12"));

        let mut out = Vec::new();
        process_state(&driver, "NetworkState", "orange.t1", Some(("pktTag", "14")), &mut out)
            .await
            .unwrap();
        let gateway = Some(("gateway", "10.1.1.254"));
        process_state(&driver, "NetworkState", "orange.t1", gateway, &mut out)
            .await
            .unwrap();
        process_state(
            &driver,
            "NetworkState",
            "orange.t1",
            Some(("subnetIsAllocated", "true")),
            &mut out,
        )
        .await
        .unwrap();
        let back: NetworkState = read_record(&driver, "orange.t1").await.unwrap();
        assert_eq!(back.pkt_tag, 14);
        assert_eq!(back.gateway, "10.1.1.254");
        assert!(back.subnet_is_allocated);

        let id = "orange.t1";
        let neg = Some(("pktTag", "-1"));
        let bad = process_state(&driver, "NetworkState", id, neg, &mut out).await;
        assert!(bad.unwrap_err().to_string().contains("Can not convert"));
        let nope = Some(("nope", "1"));
        let missing = process_state(&driver, "NetworkState", id, nope, &mut out).await;
        assert!(missing.is_err());
        let map = Some(("ipAllocMap", "1"));
        let kind = process_state(&driver, "NetworkState", id, map, &mut out).await;
        assert!(kind.unwrap_err().to_string().contains("invalid kind"));
        assert!(process_state(&driver, "Bogus", "x", None, &mut out).await.is_err());
    }
}
