//! Pool allocators for VLAN, VXLAN, subnet and endpoint-group ids.
//!
//! Every allocator persists two records through a [`StateDriver`]: a Cfg
//! record with the defined pool and an Oper record with the free set.
//! [`StateResourceManager`] looks allocators up by description and id.

pub mod bitset;
pub mod error;
pub mod fake;
pub mod netutils;
pub mod resources;
pub mod state;

pub use error::{ResourceError, StateError, is_key_not_found};
pub use fake::FakeStateDriver;
pub use resources::{
    AUTO_EPG, AUTO_SUBNET, AUTO_VLAN, AUTO_VXLAN, ResourceConfig, ResourceValue,
    StateResourceManager, SubnetConfig, SubnetIpLenPair, VxlanConfig, VxlanVlanPair,
};
pub use state::StateDriver;
