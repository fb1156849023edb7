//! UNC input connector: harvests files from a local or mounted folder tree.
//!
//! Folders are walked breadth first. Within a folder, an XML descriptor
//! named after a binary file (`image.jpg.xml` for `image.jpg`) replaces that
//! file, compared case-insensitively. An optional comma-separated list of
//! globs (case-insensitive, matched against the full path) restricts the
//! files; a descriptor matches when either its own path or its path without
//! `.xml` matches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use reqwest::Url;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::definition::DefinitionAdaptor;
use crate::error::{HarvestError, Result};
use crate::mime::MimeType;
use crate::models::{DataReference, EntityDefinition};
use crate::template::{Argument, UiTemplate};
use crate::traits::{
    BrokerIterator, Descriptor, InitContext, InputBroker, InputConnector, IteratorContext,
};

pub const TYPE: &str = "UNC";
pub const P_ROOT_FOLDER: &str = "unc-root-folder";
pub const P_PATTERN: &str = "unc-pattern";

#[derive(Debug, Default)]
pub struct UncConnector;

impl Descriptor for UncConnector {
    fn entity_type(&self) -> &str {
        TYPE
    }

    fn template(&self) -> UiTemplate {
        UiTemplate::new(
            TYPE,
            "UNC",
            vec![
                Argument::string(P_ROOT_FOLDER, "Root folder").required(),
                Argument::string(P_PATTERN, "File pattern (comma separated globs)"),
            ],
        )
    }
}

impl InputConnector for UncConnector {
    fn create_broker(&self, def: &EntityDefinition) -> Result<Box<dyn InputBroker>> {
        let adaptor = DefinitionAdaptor::new(def, TYPE)?;
        adaptor.require(P_ROOT_FOLDER)?;
        if let Some(pattern) = adaptor.get(P_PATTERN) {
            build_globset(pattern)?;
        }
        Ok(Box::new(UncBroker { adaptor }))
    }
}

pub struct UncBroker {
    adaptor: DefinitionAdaptor,
}

impl UncBroker {
    fn root(&self) -> PathBuf {
        PathBuf::from(self.adaptor.get(P_ROOT_FOLDER).unwrap_or_default())
    }
}

#[async_trait]
impl InputBroker for UncBroker {
    fn entity_definition(&self) -> &EntityDefinition {
        self.adaptor.entity_definition()
    }

    fn broker_uri(&self) -> String {
        format!("{}:{}", TYPE, self.root().display())
    }

    async fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        self.adaptor.consume(&ctx.params);
        let root = self.root();
        if !root.is_dir() {
            return Err(HarvestError::processor(format!(
                "UNC root folder is not a directory: {}",
                root.display()
            )));
        }
        Ok(())
    }

    async fn iterator(&self, ctx: &IteratorContext) -> Result<Box<dyn BrokerIterator>> {
        let root = self.root();
        let root = std::fs::canonicalize(&root).map_err(|e| {
            HarvestError::input(self.broker_uri(), format!("cannot open {}", root.display()))
                .with_source(e)
        })?;
        let pattern = match self.adaptor.get(P_PATTERN) {
            Some(p) => Some(build_globset(p)?),
            None => None,
        };
        Ok(Box::new(UncIterator {
            broker_uri: self.broker_uri(),
            broker_name: self.entity_definition().label.clone(),
            root: root.clone(),
            pattern,
            since: ctx.last_harvest,
            folders: VecDeque::from([root]),
            files: VecDeque::new(),
            first: true,
        }))
    }
}

struct UncIterator {
    broker_uri: String,
    broker_name: Option<String>,
    root: PathBuf,
    pattern: Option<GlobSet>,
    since: Option<DateTime<Utc>>,
    folders: VecDeque<PathBuf>,
    files: VecDeque<PathBuf>,
    first: bool,
}

impl UncIterator {
    fn matches(&self, path: &Path) -> bool {
        let Some(set) = &self.pattern else {
            return true;
        };
        if set.is_match(path) {
            return true;
        }
        let text = path.to_string_lossy();
        match strip_xml(&text) {
            Some(base) => set.is_match(base),
            None => false,
        }
    }

    /// List one folder, queueing sub-folders and the files worth returning.
    fn read_folder(&mut self, folder: &Path) -> std::io::Result<()> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(folder)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        // lowercase path -> file, descriptors replacing their binaries
        let mut files: BTreeMap<String, PathBuf> = BTreeMap::new();
        for entry in entries {
            // follows symlinks
            let meta = match std::fs::metadata(&entry) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %entry.display(), error = %e, "error processing path element");
                    continue;
                }
            };
            if meta.is_dir() {
                self.folders.push_back(entry);
                continue;
            }
            if !meta.is_file() || !self.matches(&entry) {
                continue;
            }
            let key = entry.to_string_lossy().to_lowercase();
            match strip_xml(&key) {
                Some(binary) => {
                    let binary = binary.to_string();
                    files.remove(&binary);
                    files.insert(key, entry);
                }
                None => {
                    if !files.contains_key(&format!("{}.xml", key)) {
                        files.insert(key, entry);
                    }
                }
            }
        }

        for (_, file) in files {
            if self.is_recent(&file) {
                self.files.push_back(file);
            }
        }
        debug!(folder = %folder.display(), files = self.files.len(), "read UNC folder");
        Ok(())
    }

    fn is_recent(&self, file: &Path) -> bool {
        let Some(since) = self.since else {
            return true;
        };
        let Ok(meta) = std::fs::metadata(file) else {
            return false;
        };
        [meta.modified(), meta.accessed(), meta.created()]
            .into_iter()
            .filter_map(|t| t.ok())
            .max()
            .map(|latest| DateTime::<Utc>::from(latest) >= since)
            .unwrap_or(true)
    }

    fn read_file(&self, path: &Path) -> Result<DataReference> {
        let content = std::fs::read(path).map_err(|e| {
            HarvestError::input(&self.broker_uri, format!("error reading {}", path.display()))
                .with_source(e)
        })?;
        let source_uri = Url::from_file_path(path).map_err(|_| {
            HarvestError::input(&self.broker_uri, format!("invalid file path {}", path.display()))
        })?;
        let last_modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        let mut data = DataReference::new(
            path.to_string_lossy(),
            source_uri,
            self.broker_uri.clone(),
            content,
        );
        data.last_modified = last_modified;
        data.broker_name = self.broker_name.clone();
        data.content_type = MimeType::from_path(&path.to_string_lossy());
        Ok(data)
    }
}

#[async_trait]
impl BrokerIterator for UncIterator {
    async fn has_next(&mut self) -> Result<bool> {
        while self.files.is_empty() {
            let Some(folder) = self.folders.pop_front() else {
                return Ok(false);
            };
            if let Err(e) = self.read_folder(&folder) {
                if std::mem::take(&mut self.first) {
                    return Err(HarvestError::input(
                        &self.broker_uri,
                        format!("error reading root folder {}", self.root.display()),
                    )
                    .with_source(e));
                }
                warn!(folder = %folder.display(), error = %e, "skipping unreadable folder");
            }
            self.first = false;
        }
        Ok(true)
    }

    async fn next(&mut self) -> Result<DataReference> {
        let path = self
            .files
            .pop_front()
            .ok_or_else(|| HarvestError::input(&self.broker_uri, "no more files"))?;
        self.read_file(&path)
    }
}

fn strip_xml(path: &str) -> Option<&str> {
    let cut = path.len().checked_sub(4)?;
    if path.is_char_boundary(cut) && path[cut..].eq_ignore_ascii_case(".xml") {
        Some(&path[..cut])
    } else {
        None
    }
}

fn build_globset(patterns: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| HarvestError::invalid(format!("invalid {} '{}': {}", P_PATTERN, pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| HarvestError::invalid(format!("invalid {}: {}", P_PATTERN, e)))
}
