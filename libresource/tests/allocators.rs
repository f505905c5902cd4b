use std::sync::{Arc, Once};

use libresource::bitset::create_bitset;
use libresource::{
    AUTO_EPG, AUTO_SUBNET, AUTO_VXLAN, FakeStateDriver, ResourceConfig, ResourceError,
    ResourceValue, StateDriver, StateResourceManager, SubnetConfig, VxlanConfig,
};
use log::info;
use serial_test::serial;

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .target(env_logger::Target::Stdout)
            .init();
    });
}

#[tokio::test]
#[serial]
async fn tenants_get_independent_pools() {
    init_logging();
    let driver = Arc::new(FakeStateDriver::new());
    let rm = StateResourceManager::new(driver.clone() as Arc<dyn StateDriver>).unwrap();

    let mut vxlans = create_bitset(14);
    vxlans.insert_range(1..4);
    let mut local_vlans = create_bitset(12);
    local_vlans.insert_range(1..4095);
    let cfg = VxlanConfig {
        vxlans,
        local_vlans,
        free_vxlans_start: 4999,
    };
    for tenant in ["blue", "red"] {
        rm.define_resource(tenant, AUTO_VXLAN, ResourceConfig::Vxlan(cfg.clone()))
            .await
            .unwrap();
    }

    for _ in 0..3 {
        rm.allocate_resource_val("blue", AUTO_VXLAN, 0).await.unwrap();
    }
    let err = rm
        .allocate_resource_val("blue", AUTO_VXLAN, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, ResourceError::Exhausted("vxlans")));

    let red = rm.allocate_resource_val("red", AUTO_VXLAN, 0).await.unwrap();
    assert_eq!(red.vxlan_vlan().unwrap().vxlan, 1);
    assert_eq!(
        rm.get_resource_list("blue", AUTO_VXLAN).await,
        (3, "5000-5002".to_string())
    );

    info!("keys after allocation: {:?}", driver.keys().await);
    rm.release().unwrap();
}

#[tokio::test]
#[serial]
async fn epg_ids_and_subnets_share_one_manager() {
    init_logging();
    let rm = StateResourceManager::new(Arc::new(FakeStateDriver::new())).unwrap();

    let mut ids = create_bitset(16);
    ids.insert_range(1..65535);
    rm.define_resource("global", AUTO_EPG, ResourceConfig::Epg(ids))
        .await
        .unwrap();
    rm.define_resource(
        "global",
        AUTO_SUBNET,
        ResourceConfig::Subnet(SubnetConfig {
            subnet_pool: "10.128.0.0".parse().unwrap(),
            subnet_pool_len: 16,
            alloc_subnet_len: 24,
        }),
    )
    .await
    .unwrap();

    let first = rm.allocate_resource_val("global", AUTO_EPG, 0).await.unwrap();
    assert_eq!(first, ResourceValue::Id(1));
    let subnet = rm
        .allocate_resource_val("global", AUTO_SUBNET, 0)
        .await
        .unwrap()
        .subnet()
        .unwrap();
    assert_eq!(subnet.ip.to_string(), "10.128.0.0");

    rm.deallocate_resource_val("global", AUTO_EPG, first)
        .await
        .unwrap();
    rm.deallocate_resource_val("global", AUTO_EPG, first)
        .await
        .unwrap();
    assert_eq!(rm.get_resource_list("global", AUTO_EPG).await.0, 0);
    assert_eq!(
        rm.get_resource_list("global", AUTO_SUBNET).await,
        (1, "0".to_string())
    );
    rm.release().unwrap();
}
