//! Field classification and rule files.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bidwatch_extract::DEFAULT_VENDORS;
use serde::Deserialize;
use tracing::info;

pub const OTHER_GROUP: &str = "OTHER";
pub const UNCLASSIFIED_CATEGORY: &str = "OTHER";

/// Assigns a field category to a bid title. Implementations may call out to
/// an external service; an error drops the bid from the run.
#[async_trait]
pub trait FieldClassifier: Send + Sync {
    async fn classify(&self, title: &str) -> Result<String>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldCategory {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldGroup {
    pub group: String,
    #[serde(default)]
    pub categories: Vec<FieldCategory>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldCatalog {
    #[serde(default)]
    pub groups: Vec<FieldGroup>,
}

impl FieldCatalog {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing categories yaml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    pub fn categories(&self) -> impl Iterator<Item = &FieldCategory> {
        self.groups.iter().flat_map(|g| g.categories.iter())
    }

    /// Group owning `category`, or [`OTHER_GROUP`].
    pub fn group_for(&self, category: &str) -> &str {
        self.groups
            .iter()
            .find(|g| g.categories.iter().any(|c| c.name == category))
            .map(|g| g.group.as_str())
            .unwrap_or(OTHER_GROUP)
    }
}

/// Picks the first catalog category with a keyword contained in the title.
pub struct KeywordFieldClassifier {
    rules: Vec<(String, Vec<String>)>,
}

impl KeywordFieldClassifier {
    pub fn new(catalog: &FieldCatalog) -> Self {
        let rules = catalog
            .categories()
            .map(|c| {
                (
                    c.name.clone(),
                    c.keywords.iter().map(|k| k.to_lowercase()).collect(),
                )
            })
            .collect();
        Self { rules }
    }
}

#[async_trait]
impl FieldClassifier for KeywordFieldClassifier {
    async fn classify(&self, title: &str) -> Result<String> {
        let title = title.to_lowercase();
        let category = self
            .rules
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| !k.is_empty() && title.contains(k.as_str())))
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| UNCLASSIFIED_CATEGORY.to_string());
        Ok(category)
    }
}

#[derive(Debug, Deserialize)]
struct VendorsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    vendors: Vec<String>,
}

/// Canonical vendor names from `vendors.yaml`, or the built-in list when the file is absent.
pub fn load_vendor_list(rules_dir: &Path) -> Result<Vec<String>> {
    let path = rules_dir.join("vendors.yaml");
    if !path.exists() {
        info!(path = %path.display(), "vendor rules not found, using built-in list");
        return Ok(DEFAULT_VENDORS.iter().map(|v| v.to_string()).collect());
    }
    let yaml = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: VendorsFile =
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed.vendors)
}
