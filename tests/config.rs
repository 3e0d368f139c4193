use std::env::temp_dir;

use meshbus::{
    config::Config,
    policy::{Decision, Policy, Rule},
};
use rand::{
    distr::{Alphanumeric, SampleString},
    rng,
};

#[tokio::test]
async fn load_round_trips_a_representative_config_file() {
    let contents = r#"
        listen = "unix:path=/tmp/meshbus-test"

        [auth]
        external = true
        cookie = false
        anonymous = false

        policy = [
            { decision = "deny", uid = 1000, interface = "com.example.Secret" },
        ]

        [pipeline]
        tx_queue_capacity = 4
        max_idle_probes = 2
    "#;

    let path = temp_dir().join(format!(
        "meshbus-config-{}.toml",
        Alphanumeric.sample_string(&mut rng(), 10)
    ));
    tokio::fs::write(&path, contents).await.unwrap();

    let config = Config::load(&path).await.unwrap();
    tokio::fs::remove_file(&path).await.unwrap();

    assert_eq!(config.listen.as_deref(), Some("unix:path=/tmp/meshbus-test"));
    assert!(config.auth.external);
    assert!(!config.auth.cookie);
    assert!(!config.auth.anonymous);
    assert_eq!(config.pipeline.tx_queue_capacity, 4);
    assert_eq!(config.pipeline.max_idle_probes, 2);

    let expected = Policy::new(vec![Rule {
        decision: Decision::Deny,
        uid: Some(1000),
        gid: None,
        destination: None,
        interface: Some("com.example.Secret".to_string()),
    }]);
    assert_eq!(config.policy, expected);
}

#[tokio::test]
async fn load_reports_the_file_path_on_a_malformed_config() {
    let path = temp_dir().join(format!(
        "meshbus-config-{}.toml",
        Alphanumeric.sample_string(&mut rng(), 10)
    ));
    tokio::fs::write(&path, "this is not valid toml = [[[").await.unwrap();

    let err = Config::load(&path).await.unwrap_err();
    tokio::fs::remove_file(&path).await.unwrap();

    assert!(err.to_string().contains(&path.display().to_string()));
}

#[tokio::test]
async fn load_missing_file_fails_instead_of_falling_back_to_defaults() {
    let path = temp_dir().join("meshbus-config-does-not-exist.toml");
    assert!(Config::load(&path).await.is_err());
}
