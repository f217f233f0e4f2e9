use super::graph::ProcessDefinition;
use super::model::ProcessModel;
use super::validate::validate_model;
use super::yaml::parse_process_yaml;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Looks up deployed definitions for the runtime.
#[async_trait]
pub trait DefinitionResolver: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Arc<ProcessDefinition>>>;

    /// Latest version of `key` in `tenant_id`; `None` is the default tenant.
    async fn find_latest_by_key(
        &self,
        key: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<Arc<ProcessDefinition>>>;
}

// ── MemoryDefinitionRepository ──

type VersionKey = (String, Option<String>);

#[derive(Default)]
struct Deployed {
    by_id: HashMap<String, Arc<ProcessDefinition>>,
    /// Versions per (key, tenant), ascending.
    by_key: HashMap<VersionKey, Vec<Arc<ProcessDefinition>>>,
}

/// In-memory definition repository.
///
/// Versions count up per key and tenant. Redeploying a model whose content
/// hash matches the latest version returns that version unchanged.
#[derive(Default)]
pub struct MemoryDefinitionRepository {
    inner: RwLock<Deployed>,
}

fn normalize_tenant(tenant_id: Option<&str>) -> Option<String> {
    tenant_id.filter(|t| !t.is_empty()).map(str::to_string)
}

impl MemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, compile and register a model.
    pub fn deploy(&self, model: ProcessModel, tenant_id: Option<&str>) -> Result<Arc<ProcessDefinition>> {
        let errors = validate_model(&model);
        if !errors.is_empty() {
            let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return Err(anyhow!(
                "Validation failed for '{}':\n{}",
                model.key,
                msgs.join("\n")
            ));
        }

        let tenant = normalize_tenant(tenant_id);
        let key = (model.key.clone(), tenant.clone());
        let mut deployed = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;

        let versions = deployed.by_key.entry(key).or_default();
        if let Some(latest) = versions.last() {
            if latest.content_hash == model.content_hash() {
                tracing::debug!(
                    key = %latest.key,
                    version = latest.version,
                    "identical model already deployed"
                );
                return Ok(latest.clone());
            }
        }
        let version = versions.last().map(|d| d.version + 1).unwrap_or(1);
        let id = format!("{}:{}:{}", model.key, version, Uuid::now_v7());
        let definition = Arc::new(
            ProcessDefinition::compile(model, id.clone(), version, tenant)
                .map_err(|e| anyhow!("Compiling definition: {}", e))?,
        );
        versions.push(definition.clone());
        deployed.by_id.insert(id, definition.clone());

        tracing::info!(
            definition_id = %definition.id,
            key = %definition.key,
            version = definition.version,
            tenant_id = ?definition.tenant_id,
            "process definition deployed"
        );
        Ok(definition)
    }

    pub fn deploy_yaml(&self, yaml: &str, tenant_id: Option<&str>) -> Result<Arc<ProcessDefinition>> {
        self.deploy(parse_process_yaml(yaml)?, tenant_id)
    }
}

#[async_trait]
impl DefinitionResolver for MemoryDefinitionRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Arc<ProcessDefinition>>> {
        let deployed = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(deployed.by_id.get(id).cloned())
    }

    async fn find_latest_by_key(
        &self,
        key: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<Arc<ProcessDefinition>>> {
        let deployed = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(deployed
            .by_key
            .get(&(key.to_string(), normalize_tenant(tenant_id)))
            .and_then(|versions| versions.last().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_TASK: &str = r#"
key: oneTask
nodes:
  - kind: Start
    id: start
  - kind: UserTask
    id: theTask
  - kind: End
    id: end
edges:
  - from: start
    to: theTask
  - from: theTask
    to: end
"#;

    #[tokio::test]
    async fn test_versions_per_tenant_and_duplicate_filtering() {
        let repo = MemoryDefinitionRepository::new();
        let v1 = repo.deploy_yaml(ONE_TASK, None).unwrap();
        let again = repo.deploy_yaml(ONE_TASK, None).unwrap();
        assert_eq!(v1.id, again.id);
        assert_eq!(v1.version, 1);

        let mut changed = parse_process_yaml(ONE_TASK).unwrap();
        changed.name = Some("One task".into());
        let v2 = repo.deploy(changed, None).unwrap();
        assert_eq!(v2.version, 2);

        let tenant = repo.deploy_yaml(ONE_TASK, Some("acme")).unwrap();
        assert_eq!(tenant.version, 1);
        assert_eq!(tenant.tenant_id.as_deref(), Some("acme"));

        let latest = repo.find_latest_by_key("oneTask", None).await.unwrap().unwrap();
        assert_eq!(latest.id, v2.id);
        let latest = repo.find_latest_by_key("oneTask", Some("")).await.unwrap().unwrap();
        assert_eq!(latest.id, v2.id);
        let latest = repo.find_latest_by_key("oneTask", Some("acme")).await.unwrap().unwrap();
        assert_eq!(latest.id, tenant.id);
        assert!(repo.find_latest_by_key("oneTask", Some("other")).await.unwrap().is_none());

        assert_eq!(repo.find_by_id(&v1.id).await.unwrap().unwrap().version, 1);
        assert!(repo.find_by_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_model_rejected() {
        let repo = MemoryDefinitionRepository::new();
        let err = repo
            .deploy_yaml("key: broken\nnodes: []\nedges: []\n", None)
            .unwrap_err();
        assert!(err.to_string().contains("V3"));
    }
}
