use anyhow::Result;
use log::{error, info};

use super::NetMaster;
use super::network::network_id;
use crate::mastercfg::{
    EndpointGroupState, NetworkState, clear_record, endpoint_group_key, read_record, write_record,
};

impl NetMaster {
    /// Writes the state record of an endpoint group. The group shares the
    /// packet tags of its network.
    pub async fn create_endpoint_group(
        &self,
        tenant: &str,
        network: &str,
        group: &str,
        epg_id: u32,
    ) -> Result<()> {
        let driver = self.driver();
        let nw: NetworkState = read_record(driver, &network_id(network, tenant))
            .await
            .inspect_err(|e| error!("could not find network {network}.{tenant}. Err: {e}"))?;

        let epg = EndpointGroupState {
            id: endpoint_group_key(group, tenant),
            group_name: group.to_string(),
            tenant_name: tenant.to_string(),
            network_name: network.to_string(),
            endpoint_group_id: epg_id,
            pkt_tag_type: nw.pkt_tag_type,
            pkt_tag: nw.pkt_tag,
            ext_pkt_tag: nw.ext_pkt_tag,
            ep_count: 0,
        };
        write_record(driver, &epg).await?;
        info!("created endpoint group {} with id {epg_id}", epg.id);
        Ok(())
    }

    pub async fn delete_endpoint_group(&self, tenant: &str, group: &str) -> Result<()> {
        let driver = self.driver();
        let key = endpoint_group_key(group, tenant);
        read_record::<EndpointGroupState>(driver, &key)
            .await
            .inspect_err(|e| error!("error reading endpoint group {key}. Err: {e}"))?;
        clear_record::<EndpointGroupState>(driver, &key).await?;
        Ok(())
    }
}
