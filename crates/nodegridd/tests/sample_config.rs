//! The shipped `nodegrid.toml` must stay loadable.

use nodegrid_backend::{CapacityBackend, from_config};
use nodegrid_core::NodegridConfig;
use nodegrid_state::NodeRegistry;

const SAMPLE: &str = include_str!("../../../nodegrid.toml");

#[test]
fn sample_config_parses_and_validates() {
    let config = NodegridConfig::from_toml_str(SAMPLE).unwrap();
    config.validate().unwrap();
    assert_eq!(config.provisioners.len(), 1);
    assert!(config.provisioners[0].limits.is_some());
    assert_eq!(config.disruption_budgets[0].max_unavailable, 1);
}

#[tokio::test]
async fn sample_backend_offers_both_shapes() {
    let config = NodegridConfig::from_toml_str(SAMPLE).unwrap();
    let backend = from_config(&config.backend);
    let shapes = backend.describe_shapes(&Default::default()).await.unwrap();
    let names: Vec<&str> = shapes.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["c.4", "c.8"]);
}

#[test]
fn sample_registry_survives_reopen() {
    let config = NodegridConfig::from_toml_str(SAMPLE).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodegrid.redb");
    {
        let registry = NodeRegistry::open(&path).unwrap();
        for provisioner in &config.provisioners {
            registry.put_provisioner(provisioner).unwrap();
        }
    }
    let registry = NodeRegistry::open(&path).unwrap();
    assert_eq!(registry.list_provisioners().unwrap()[0].name, "default");
}
