mod common;

use common::{fixture_config, init_logging};

#[test]
fn fixture_loads() {
    init_logging();
    let cfg = fixture_config();
    assert_eq!(cfg.store.endpoints, vec!["http://127.0.0.1:2379".to_string()]);
    assert_eq!(cfg.listen_url, cfg.control_url);
    assert_eq!(cfg.follower_settle_ms, 10);
    assert_eq!(cfg.defaults.vlans, "1-4094");
    assert_eq!(cfg.rpc_port, 9001);
}
