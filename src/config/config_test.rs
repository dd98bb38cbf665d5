use std::time::Duration;

use serial_test::serial;
use temp_env::with_vars;

use super::*;
use crate::Error;

fn cleanup_all_keyval_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("KEYVAL__") {
            std::env::remove_var(&key);
        }
    }
}

fn node(endpoint: &str) -> NodeConfig {
    NodeConfig {
        endpoint: endpoint.to_string(),
        db: 0,
        allow_read_from_replica: false,
        tls: TlsConfig::default(),
        client: ClientConfig::default(),
    }
}

fn cluster(endpoints: &[&str]) -> ClusterConfig {
    ClusterConfig {
        endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
        allow_read_from_replica: false,
        max_redirects: 0,
        route_by_latency: false,
        client: ClientConfig::default(),
    }
}

fn sentinel(
    endpoints: &[&str],
    master_name: &str,
) -> SentinelConfig {
    SentinelConfig {
        endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
        master_name: master_name.to_string(),
        db: 0,
        client: ClientConfig::default(),
    }
}

#[test]
fn default_client_config_should_use_hardcoded_values() {
    let client = ClientConfig::default();

    assert_eq!(client.dial_timeout(), Duration::from_secs(5));
    assert_eq!(client.read_timeout(), Duration::from_secs(3));
    assert_eq!(client.write_timeout(), Duration::from_secs(3));
    assert_eq!(client.pool_size(), 10);
    assert_eq!(client.pool_timeout(), Duration::from_secs(4));
    assert!(client.password.is_empty());
}

#[test]
fn zero_client_values_should_fall_back_to_defaults() {
    let client = ClientConfig {
        password: String::new(),
        dial_timeout_in_ms: 0,
        read_timeout_in_ms: 0,
        write_timeout_in_ms: 0,
        pool: PoolConfig {
            pool_size: 0,
            pool_timeout_in_ms: 0,
            idle_timeout_in_ms: 0,
            idle_check_frequency_in_ms: 0,
        },
    };

    assert_eq!(client.dial_timeout(), Duration::from_secs(5));
    assert_eq!(client.pool_size(), 10);
    assert_eq!(client.idle_timeout(), Duration::from_secs(300));
    assert!(client.validate().is_ok());
}

#[test]
fn idle_check_slower_than_idle_timeout_should_be_rejected() {
    let mut client = ClientConfig::default();
    client.pool.idle_timeout_in_ms = 1000;
    client.pool.idle_check_frequency_in_ms = 5000;

    assert!(matches!(client.validate(), Err(Error::Config(_))));
}

#[test]
fn resolve_should_pick_the_single_configured_topology() {
    let topology = TopologyConfig::resolve(Some(node("127.0.0.1:6379")), None, None).unwrap();
    assert_eq!(topology.kind(), TopologyKind::Node);

    let topology = TopologyConfig::resolve(None, Some(cluster(&["10.0.0.1:7000"])), None).unwrap();
    assert_eq!(topology.kind(), TopologyKind::Cluster);
}

#[test]
fn resolve_should_reject_missing_topology() {
    let result = TopologyConfig::resolve(None, None, None);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn resolve_should_reject_ambiguous_topology() {
    let result = TopologyConfig::resolve(
        Some(node("127.0.0.1:6379")),
        Some(cluster(&["127.0.0.1:7000"])),
        None,
    );
    let err = result.unwrap_err();
    assert!(err.to_string().contains("ambiguous"));
}

#[test]
fn validation_should_reject_malformed_endpoints() {
    for endpoint in ["", "localhost", ":6379", "host:port", "host:70000"] {
        let topology = TopologyConfig::Node(node(endpoint));
        assert!(topology.validate().is_err(), "{endpoint:?} should be rejected");
    }

    let topology = TopologyConfig::Cluster(cluster(&[]));
    assert!(topology.validate().is_err());
}

#[test]
fn validation_should_require_sentinel_master_name() {
    let topology = TopologyConfig::Sentinel(sentinel(&["127.0.0.1:26379"], " "));
    assert!(topology.validate().is_err());

    let topology = TopologyConfig::Sentinel(sentinel(&["127.0.0.1:26379"], "mymaster"));
    assert!(topology.validate().is_ok());
}

#[test]
fn validation_should_detect_invalid_tls_settings() {
    let mut config = node("127.0.0.1:6379");
    config.tls.enabled = true;
    assert!(TopologyConfig::Node(config.clone()).validate().is_err());

    config.tls.ca_file = "ca.pem".into();
    config.tls.cert_file = "client.pem".into();
    assert!(TopologyConfig::Node(config.clone()).validate().is_err());

    config.tls.key_file = "client.key".into();
    assert!(TopologyConfig::Node(config.clone()).validate().is_ok());
    assert!(config.tls.mutual());

    config.tls.insecure_skip_verify = true;
    assert!(TopologyConfig::Node(config).validate().is_err());
}

#[test]
fn disabled_tls_should_skip_validation() {
    let tls = TlsConfig {
        insecure_skip_verify: true,
        ..Default::default()
    };
    assert!(tls.validate().is_ok());
}

#[test]
fn max_redirects_zero_should_mean_default() {
    let mut config = cluster(&["127.0.0.1:7000"]);
    assert_eq!(config.max_redirects(), 3);
    config.max_redirects = 8;
    assert_eq!(config.max_redirects(), 8);
}

#[test]
fn watch_config_should_reject_zero_values() {
    let mut watch = WatchConfig::default();
    assert!(watch.validate().is_ok());
    assert_eq!(watch.delivery_timeout(), Duration::from_secs(1));

    watch.subscription_buffer_size = 0;
    assert!(watch.validate().is_err());

    let watch = WatchConfig {
        delivery_timeout_in_ms: 0,
        ..Default::default()
    };
    assert!(watch.validate().is_err());
}

#[test]
#[serial]
fn load_should_read_yaml_node_file() {
    cleanup_all_keyval_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("node-client.yaml");
    std::fs::write(
        &config_path,
        r#"
endpoint: "127.0.0.1:6379"
db: 2
client:
  password: "secret"
  pool:
    pool_size: 4
"#,
    )
    .unwrap();

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let topology = TopologyConfig::load(TopologyKind::Node, &config_path).unwrap();
        match topology {
            TopologyConfig::Node(c) => {
                assert_eq!(c.endpoint, "127.0.0.1:6379");
                assert_eq!(c.db, 2);
                assert_eq!(c.client.password, "secret");
                assert_eq!(c.client.pool_size(), 4);
                assert_eq!(c.client.read_timeout(), Duration::from_secs(3));
            }
            other => panic!("unexpected topology {other:?}"),
        }
    });
}

#[test]
#[serial]
fn environment_variables_should_have_highest_priority() {
    cleanup_all_keyval_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("cluster-client.toml");
    std::fs::write(
        &config_path,
        r#"
        endpoints = ["127.0.0.1:7000", "127.0.0.1:7001"]
        max_redirects = 5
        "#,
    )
    .unwrap();

    with_vars(vec![("KEYVAL__MAX_REDIRECTS", Some("9"))], || {
        let topology = TopologyConfig::load(TopologyKind::Cluster, &config_path).unwrap();
        match topology {
            TopologyConfig::Cluster(c) => {
                assert_eq!(c.endpoints.len(), 2);
                assert_eq!(c.max_redirects(), 9);
            }
            other => panic!("unexpected topology {other:?}"),
        }
    });
}

#[test]
#[serial]
fn load_should_fail_for_missing_file() {
    cleanup_all_keyval_env_vars();
    let result = TopologyConfig::load(TopologyKind::Sentinel, "/nonexistent/sentinel.yaml");
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn settings_should_resolve_single_section() {
    cleanup_all_keyval_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("settings.toml");
    std::fs::write(
        &config_path,
        r#"
        request_timeout_in_ms = 250

        [sentinel]
        endpoints = ["127.0.0.1:26379"]
        master_name = "mymaster"

        [watch]
        delivery_timeout_in_ms = 50
        "#,
    )
    .unwrap();

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let settings = Settings::load(Some(&config_path)).unwrap();
        assert_eq!(settings.request_timeout(), Duration::from_millis(250));
        assert_eq!(settings.watch.delivery_timeout(), Duration::from_millis(50));
        assert_eq!(settings.watch.subscription_buffer_size, 1024);

        let topology = settings.topology().unwrap();
        assert_eq!(topology.kind(), TopologyKind::Sentinel);
    });
}

#[test]
#[serial]
fn settings_without_topology_should_fail_to_resolve() {
    cleanup_all_keyval_env_vars();
    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.request_timeout(), Duration::from_secs(5));
        assert!(settings.topology().is_err());
    });
}
