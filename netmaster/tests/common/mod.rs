#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;

use netmaster::config::{NetmasterConfig, load_config};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .target(env_logger::Target::Stdout)
            .is_test(true)
            .init();
    });
}

/// `TEST_CONFIG_PATH` when set, else the fixture next to this file.
pub fn fixture_path() -> PathBuf {
    match std::env::var("TEST_CONFIG_PATH") {
        Ok(p) => PathBuf::from(p),
        Err(_) => PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/config.yaml"),
    }
}

pub fn fixture_config() -> NetmasterConfig {
    load_config(fixture_path().to_str().unwrap()).unwrap()
}

/// Fixture config moved onto a free loopback port.
pub fn local_config() -> NetmasterConfig {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let mut cfg = fixture_config();
    cfg.listen_url = format!("127.0.0.1:{port}");
    cfg.control_url = cfg.listen_url.clone();
    cfg
}
