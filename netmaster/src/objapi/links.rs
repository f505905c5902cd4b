//! Relationships between model objects.
//!
//! A link is one record keyed by both ends, so adding or removing it is a
//! single write. Forward lookups are prefix reads; reverse lookups scan.

use std::sync::Arc;

use anyhow::Result;
use libresource::StateDriver;
use serde::{Deserialize, Serialize};

use super::model::{MODEL_PREFIX, ModelObject};

const LINKS_PREFIX: &str = "links/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub from_type: String,
    pub from_key: String,
    pub to_type: String,
    pub to_key: String,
}

fn links_root() -> String {
    format!("{MODEL_PREFIX}{LINKS_PREFIX}")
}

fn forward_prefix(from_type: &str, from_key: &str, to_type: &str) -> String {
    format!("{}{from_type}/{from_key}/{to_type}/", links_root())
}

impl Link {
    pub fn between<F: ModelObject, T: ModelObject>(from: &F, to: &T) -> Self {
        Self {
            from_type: F::KIND.to_string(),
            from_key: from.key(),
            to_type: T::KIND.to_string(),
            to_key: to.key(),
        }
    }

    fn path(&self) -> String {
        format!(
            "{}{}",
            forward_prefix(&self.from_type, &self.from_key, &self.to_type),
            self.to_key
        )
    }
}

#[derive(Clone)]
pub struct LinkTable {
    driver: Arc<dyn StateDriver>,
}

impl LinkTable {
    pub fn new(driver: Arc<dyn StateDriver>) -> Self {
        Self { driver }
    }

    pub async fn add<F: ModelObject, T: ModelObject>(&self, from: &F, to: &T) -> Result<()> {
        let link = Link::between(from, to);
        self.driver.write_state(&link.path(), &link).await?;
        Ok(())
    }

    pub async fn remove<F: ModelObject, T: ModelObject>(&self, from: &F, to: &T) -> Result<()> {
        self.driver
            .clear_state(&Link::between(from, to).path())
            .await?;
        Ok(())
    }

    /// Keys of the `T` objects linked from `from`.
    pub async fn targets<F: ModelObject, T: ModelObject>(&self, from: &F) -> Result<Vec<String>> {
        let links: Vec<Link> = self
            .driver
            .list_state(&forward_prefix(F::KIND, &from.key(), T::KIND))
            .await?;
        Ok(links.into_iter().map(|l| l.to_key).collect())
    }

    /// Keys of the `F` objects that link to `to`.
    pub async fn sources<F: ModelObject, T: ModelObject>(&self, to: &T) -> Result<Vec<String>> {
        let key = to.key();
        let links: Vec<Link> = self
            .driver
            .list_state(&format!("{}{}/", links_root(), F::KIND))
            .await?;
        Ok(links
            .into_iter()
            .filter(|l| l.to_type == T::KIND && l.to_key == key)
            .map(|l| l.from_key)
            .collect())
    }

    /// Drops every link touching the object, in either direction.
    pub async fn unlink_all<O: ModelObject>(&self, obj: &O) -> Result<()> {
        let key = obj.key();
        let links: Vec<Link> = self.driver.list_state(&links_root()).await?;
        for link in links {
            let touches = (link.from_type == O::KIND && link.from_key == key)
                || (link.to_type == O::KIND && link.to_key == key);
            if touches {
                self.driver.clear_state(&link.path()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objapi::model::{EndpointGroup, Network, Policy, Tenant};
    use libresource::FakeStateDriver;

    #[tokio::test]
    async fn forward_and_reverse_lookups() {
        let links = LinkTable::new(Arc::new(FakeStateDriver::new()));
        let tenant = Tenant {
            tenant_name: "t1".into(),
            ..Default::default()
        };
        let net = Network {
            tenant_name: "t1".into(),
            network_name: "n1".into(),
            ..Default::default()
        };
        let epg = EndpointGroup {
            tenant_name: "t1".into(),
            group_name: "web".into(),
            network_name: "n1".into(),
            ..Default::default()
        };
        let policy = Policy {
            tenant_name: "t1".into(),
            policy_name: "pol".into(),
        };

        links.add(&tenant, &net).await.unwrap();
        links.add(&net, &epg).await.unwrap();
        links.add(&policy, &epg).await.unwrap();
        links.add(&net, &epg).await.unwrap();

        assert_eq!(
            links.targets::<_, Network>(&tenant).await.unwrap(),
            vec!["t1:n1".to_string()]
        );
        assert_eq!(links.targets::<_, EndpointGroup>(&net).await.unwrap().len(), 1);
        assert_eq!(
            links.sources::<Policy, _>(&epg).await.unwrap(),
            vec!["t1:pol".to_string()]
        );

        links.unlink_all(&epg).await.unwrap();
        assert!(links.targets::<_, EndpointGroup>(&net).await.unwrap().is_empty());
        assert!(links.sources::<Policy, _>(&epg).await.unwrap().is_empty());
        assert_eq!(links.targets::<_, Network>(&tenant).await.unwrap().len(), 1);

        links.remove(&tenant, &net).await.unwrap();
        assert!(links.targets::<_, Network>(&tenant).await.unwrap().is_empty());
    }
}
