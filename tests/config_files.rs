//! Configuration loading from files

use kmsdm::config::NotifyPolicy;
use kmsdm::Config;
use std::path::PathBuf;

fn write_config(name: &str, content: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("kmsdm-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_full_file() {
    let path = write_config(
        "full.toml",
        r#"
[device]
preferred_index = 1
primary_node = "/dev/dri/card1"
vendor_id = 0x1002

[hotplug]
enabled = false

[notify]
policy = "reduced"

[planes]
reserve = true

[[planes.reserved]]
display = 0
planes = [31]

[sync]
native_fences = false
"#,
    );

    let config = Config::load_from_file(&path).unwrap();
    assert_eq!(config.device.preferred_index, 1);
    assert_eq!(config.device.primary_node, "/dev/dri/card1");
    assert_eq!(config.device.vendor_id, 0x1002);
    assert!(!config.hotplug.enabled);
    assert_eq!(config.notify.policy, NotifyPolicy::Reduced);
    assert_eq!(config.planes.reserved_planes(0), &[31]);
    assert!(!config.sync.native_fences);
}

#[test]
fn test_empty_file_uses_defaults() {
    let path = write_config("empty.toml", "");
    let config = Config::load_from_file(&path).unwrap();
    assert_eq!(config.device.primary_node, "/dev/dri/card0");
    assert!(config.hotplug.enabled);
}

#[test]
fn test_malformed_file_is_an_error() {
    let path = write_config("broken.toml", "[device\nvendor_id = ");
    let err = Config::load_from_file(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("broken.toml"));
}

#[test]
fn test_missing_file_is_an_error() {
    assert!(Config::load_from_file(std::path::Path::new("/nonexistent/kmsdm.toml")).is_err());
}
