//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use shipyard_config::SystemConfig;
use shipyard_core::JobSpec;
use std::path::Path;

pub fn validate(path: &Path) -> Result<()> {
    let config = SystemConfig::load(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;

    println!("Configuration is valid");
    println!(
        "  queue: {} active, {} pending",
        config.queue.max_active, config.queue.max_pending
    );
    println!(
        "  retry: {} attempts, {:?} backoff",
        config.retry.attempts, config.retry.backoff
    );
    Ok(())
}

pub fn render(path: &Path) -> Result<()> {
    let spec = load_job(path)?;
    spec.image
        .validate()
        .with_context(|| format!("Invalid image in {}", path.display()))?;
    print!("{}", spec.image.render());
    Ok(())
}

/// Read a job file.
pub fn load_job(path: &Path) -> Result<JobSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::Layer;
    use std::io::Write;

    const JOB: &str = r#"{
        "image": {
            "name": "app",
            "tag": "v1",
            "layers": [
                { "type": "stage", "base": "alpine", "tag": "3.19" },
                { "type": "run", "command": "apk add --no-cache curl" },
                { "type": "cmd", "command": ["curl", "--version"] }
            ]
        },
        "registry": { "uri": "registry.local", "user": "ci", "password": "secret" }
    }"#;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_job() {
        let file = write_temp(JOB);
        let spec = load_job(file.path()).unwrap();

        assert_eq!(spec.image.full_name(), "app:v1");
        assert_eq!(spec.registry.uri, "registry.local");
        assert!(spec.build_options.is_none());
        assert!(matches!(spec.image.layers[0], Layer::Stage { .. }));
    }

    #[test]
    fn test_load_job_rejects_garbage() {
        let file = write_temp("not json");
        let err = load_job(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse job file"));
    }

    #[test]
    fn test_render_requires_stage() {
        let file = write_temp(&JOB.replace(r#""type": "stage", "base": "alpine", "tag": "3.19""#, r#""type": "workdir", "path": "/app""#));
        assert!(render(file.path()).is_err());
    }

    #[test]
    fn test_validate_config() {
        let file = write_temp("queue {\n    max-active 2\n}\n");
        assert!(validate(file.path()).is_ok());

        let file = write_temp("queue {\n    max-active 0\n}\n");
        assert!(validate(file.path()).is_err());
    }
}
