// facility-sync/src/templates.rs

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Result, SyncError};

pub const PAGE_NUM_TAG: &str = "TEMPLATE_PAGE_NUM";
pub const PAGE_SIZE_TAG: &str = "TEMPLATE_PAGE_SIZE";

/// Query text per operation name (the file stem when loaded from a directory).
///
/// Rendering fills `TEMPLATE_PAGE_SIZE` once per fetch, then the caller's
/// substitutions, then `TEMPLATE_PAGE_NUM` for every page.
#[derive(Debug, Clone, Default)]
pub struct QueryTemplates {
    templates: HashMap<String, String>,
}

impl QueryTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(templates: HashMap<String, String>) -> Self {
        Self { templates }
    }

    /// Loads every file under `dir`, recursively.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut templates = HashMap::new();
        visit(dir, &mut templates)?;
        tracing::info!(dir = %dir.display(), count = templates.len(), "Loaded query templates");
        Ok(Self { templates })
    }

    pub fn insert(&mut self, operation: impl Into<String>, text: impl Into<String>) {
        self.templates.insert(operation.into(), text.into());
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.templates.contains_key(operation)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Template with page size and substitutions applied; page number still open.
    pub fn render(
        &self,
        operation: &str,
        page_size: u32,
        substitutions: &[(String, String)],
    ) -> Result<RenderedQuery> {
        let template = self
            .templates
            .get(operation)
            .ok_or_else(|| SyncError::UnknownOperation(operation.to_string()))?;
        let mut text = template.replace(PAGE_SIZE_TAG, &page_size.to_string());
        for (tag, value) in substitutions {
            if tag == PAGE_NUM_TAG || tag == PAGE_SIZE_TAG {
                return Err(SyncError::ReservedTag(tag.clone()));
            }
            text = text.replace(tag.as_str(), value);
        }
        Ok(RenderedQuery { text })
    }
}

fn visit(dir: &Path, out: &mut HashMap<String, String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            visit(&path, out)?;
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            tracing::warn!(path = %path.display(), "Skipping template with non UTF-8 name");
            continue;
        };
        let text = fs::read_to_string(&path)?;
        tracing::debug!(operation = stem, path = %path.display(), "Loaded query template");
        out.insert(stem.to_string(), text);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    text: String,
}

impl RenderedQuery {
    pub fn for_page(&self, page: u32) -> String {
        self.text.replace(PAGE_NUM_TAG, &page.to_string())
    }
}
