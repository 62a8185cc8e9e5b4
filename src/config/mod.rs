// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a file (YAML or JSON)
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config = parse_config(&contents, path)?;
    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|s| s.to_str());
    let config = if matches!(extension, Some("yaml") | Some("yml")) {
        serde_yaml::from_str(contents).context("Failed to parse YAML config")?
    } else {
        serde_json::from_str(contents).context("Failed to parse JSON config")?
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::CacheStrategy;
    use crate::load_balancer::LoadBalancingAlgorithm;

    const YAML: &str = r#"
endpoints:
  - id: api-1
    url: http://10.0.0.1:8080
    group: api
    weight: 3
    cache:
      enabled: true
      strategy: aggressive
      ttl_secs: 60
  - id: api-2
    url: http://10.0.0.2:8080
    group: api
    health_check:
      path: /ready
      failure_threshold: 2
chains:
  - primary: api-1
    fallbacks: [api-2]
load_balancer:
  algorithm: weighted_round_robin
failover:
  max_concurrent_checks: 4
"#;

    #[test]
    fn test_parse_yaml() {
        let config = parse_config(YAML, Path::new("config.yaml")).unwrap();
        config.validate().unwrap();

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].weight, 3);
        assert_eq!(config.endpoints[0].cache.strategy, CacheStrategy::Aggressive);
        assert_eq!(config.endpoints[1].health_check.path, "/ready");
        assert_eq!(
            config.load_balancer.algorithm,
            LoadBalancingAlgorithm::WeightedRoundRobin
        );
        assert_eq!(config.failover.max_concurrent_checks, 4);
        assert_eq!(config.failover.recovery_check_interval_secs, 60);
        assert_eq!(config.cache.max_content_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_unknown_algorithm_fails_fast() {
        let yaml = "load_balancer:\n  algorithm: fastest_guess\n";
        assert!(parse_config(yaml, Path::new("c.yml")).is_err());
    }

    #[test]
    fn test_chain_with_unknown_endpoint_is_rejected() {
        let mut config = parse_config(YAML, Path::new("config.yaml")).unwrap();
        config.chains[0].fallbacks.push("api-9".into());

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("api-9"));
    }

    #[test]
    fn test_unspecified_chain_strategy_is_rejected() {
        let yaml = YAML.replace("fallbacks: [api-2]", "fallbacks: [api-2]\n    strategy: parallel");
        let config = parse_config(&yaml, Path::new("config.yaml")).unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_endpoint_is_rejected() {
        let mut config = parse_config(YAML, Path::new("config.yaml")).unwrap();
        let dup = config.endpoints[0].clone();
        config.endpoints.push(dup);

        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_config_reads_json() {
        let config = parse_config(YAML, Path::new("config.yaml")).unwrap();
        let path = std::env::temp_dir().join(format!("ptc-config-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, serde_json::to_string(&config).unwrap())
            .await
            .unwrap();

        let loaded = load_config(&path).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        assert_eq!(loaded.endpoints.len(), 2);
        assert_eq!(loaded.chains[0].primary, "api-1");
    }
}
