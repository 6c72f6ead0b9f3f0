#![allow(dead_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use secureflow::{
    knowledge_base::DirectoryKnowledgeBase,
    missing::CollectingSink,
    pipeline::{Collaborators, PipelineOptions, secure_workflow},
    remote::{Manifest, Registry, SourceControl, TagObject, TagRef},
    report::WorkflowReport,
};

pub const CHECKOUT_SHA: &str = "ee0669bd1cc54295c223e0bb666b733df41de1c5";
pub const SETUP_NODE_SHA: &str = "f1f314fca9dfce2769ece7d933488f076716723e";
pub const HARDEN_SHA: &str = "0d381219ddf674d61a7572ddd19d7941e271515c";
pub const PREFIX_SHA: &str = "1111111111111111111111111111111111111111";
pub const IMAGE_DIGEST: &str =
    "sha256:1e0e0bbd0f2ab1a2b3f1f2c5d9b1d6d4e2f0b6c1a3e5d7f9b1c3e5a7d9f1b3c5";

pub fn test_data(path: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/test-data")
        .join(path)
}

pub fn workflow(name: &str) -> String {
    std::fs::read_to_string(test_data(&format!("workflows/{name}"))).unwrap()
}

/// A source-control host with a fixed set of refs and tags.
pub struct FakeHost {
    refs: HashMap<&'static str, &'static str>,
    tags: HashMap<(&'static str, &'static str), Vec<TagRef>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        let tag = |name: &str, sha: &str| TagRef {
            name: name.into(),
            object: TagObject::Commit(sha.into()),
        };

        Self {
            refs: HashMap::from([
                ("actions/checkout@v2", CHECKOUT_SHA),
                ("actions/setup-node@v1", SETUP_NODE_SHA),
                ("step-security/harden-runner@v2", HARDEN_SHA),
                ("a/b@v1", PREFIX_SHA),
                ("a/b@v1.2.3", PREFIX_SHA),
            ]),
            tags: HashMap::from([
                (("checkout", "v2."), vec![tag("v2.7.0", CHECKOUT_SHA)]),
                (
                    ("setup-node", "v1."),
                    vec![
                        tag("v1.4.5", "0000000000000000000000000000000000000000"),
                        tag("v1.4.6", SETUP_NODE_SHA),
                    ],
                ),
                (("harden-runner", "v2."), vec![tag("v2.9.1", HARDEN_SHA)]),
                (("b", "v1."), vec![tag("v1.2.3", PREFIX_SHA)]),
            ]),
        }
    }
}

#[async_trait]
impl SourceControl for FakeHost {
    async fn resolve_ref(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> anyhow::Result<Option<String>> {
        Ok(self
            .refs
            .get(format!("{owner}/{repo}@{git_ref}").as_str())
            .map(|sha| sha.to_string()))
    }

    async fn list_matching_tags(
        &self,
        _owner: &str,
        repo: &str,
        prefix: &str,
    ) -> anyhow::Result<Vec<TagRef>> {
        Ok(self
            .tags
            .iter()
            .find(|(key, _)| **key == (repo, prefix))
            .map(|(_, tags)| tags.clone())
            .unwrap_or_default())
    }

    async fn latest_release(&self, owner: &str, repo: &str) -> anyhow::Result<Option<String>> {
        Ok((owner == "step-security" && repo == "action-semantic-pull-request")
            .then(|| "v5.5.5".to_string()))
    }
}

/// A registry with a single image and no immutable action packages.
pub struct FakeRegistry;

#[async_trait]
impl Registry for FakeRegistry {
    async fn get_manifest(&self, reference: &str) -> anyhow::Result<Option<Manifest>> {
        Ok((reference == "ghcr.io/x/y:latest").then(|| Manifest {
            artifact_type: None,
            digest: IMAGE_DIGEST.into(),
        }))
    }
}

/// Everything a pipeline run needs, with the missing actions it reported.
pub struct Harness {
    pub knowledge_base: DirectoryKnowledgeBase,
    pub sink: CollectingSink,
    pub host: FakeHost,
    pub registry: FakeRegistry,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            knowledge_base: DirectoryKnowledgeBase::new(test_data("kb")),
            sink: CollectingSink::new(),
            host: FakeHost::default(),
            registry: FakeRegistry,
        }
    }

    pub async fn run(&self, text: &str, options: &PipelineOptions) -> WorkflowReport {
        let collaborators = Collaborators {
            knowledge_base: &self.knowledge_base,
            missing: &self.sink,
            source_control: Some(&self.host),
            registry: Some(&self.registry),
        };

        secure_workflow(text, options, collaborators).await.unwrap()
    }
}
