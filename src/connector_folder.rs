//! FOLDER output connector: writes every record as a file.
//!
//! Files land under `<root folder>/<broker root>/<source path>`, where the
//! broker root is derived from the URI of the task's input broker (its host,
//! or its path when there is no host). With cleanup enabled, files present
//! before a full run that were not re-published during it are deleted at
//! the end, unless the run reported any error.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::definition::DefinitionAdaptor;
use crate::error::{HarvestError, Result};
use crate::models::{DataReference, EntityDefinition, PublishingStatus};
use crate::process::ErrorFlag;
use crate::template::{Argument, UiTemplate};
use crate::traits::{Descriptor, InitContext, OutputBroker, OutputConnector};

pub const TYPE: &str = "FOLDER";
pub const P_ROOT_FOLDER: &str = "folder-root-folder";
pub const P_CLEANUP: &str = "folder-cleanup";

#[derive(Debug, Default)]
pub struct FolderConnector;

impl Descriptor for FolderConnector {
    fn entity_type(&self) -> &str {
        TYPE
    }

    fn template(&self) -> UiTemplate {
        UiTemplate::new(
            TYPE,
            "Folder",
            vec![
                Argument::string(P_ROOT_FOLDER, "Root folder").required(),
                Argument::bool(P_CLEANUP, "Perform cleanup", false),
            ],
        )
    }
}

impl OutputConnector for FolderConnector {
    fn create_broker(&self, def: &EntityDefinition) -> Result<Box<dyn OutputBroker>> {
        let adaptor = DefinitionAdaptor::new(def, TYPE)?;
        adaptor.require(P_ROOT_FOLDER)?;
        Ok(Box::new(FolderBroker {
            adaptor,
            broker_root: None,
            existing: HashSet::new(),
            cleanup: false,
            failed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

pub struct FolderBroker {
    adaptor: DefinitionAdaptor,
    broker_root: Option<PathBuf>,
    existing: HashSet<PathBuf>,
    cleanup: bool,
    failed: Arc<AtomicBool>,
}

impl FolderBroker {
    fn root_folder(&self) -> PathBuf {
        PathBuf::from(self.adaptor.get(P_ROOT_FOLDER).unwrap_or_default())
    }
}

#[async_trait]
impl OutputBroker for FolderBroker {
    fn entity_definition(&self) -> &EntityDefinition {
        self.adaptor.entity_definition()
    }

    async fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        self.adaptor.consume(&ctx.params);
        let segments = broker_root_segments(&ctx.source_broker_uri);
        let mut broker_root = self.root_folder();
        broker_root.extend(&segments);
        std::fs::create_dir_all(&broker_root).map_err(|e| {
            HarvestError::processor(format!(
                "error initializing folder broker at {}",
                broker_root.display()
            ))
            .with_source(e)
        })?;
        let broker_root = std::fs::canonicalize(&broker_root)?;

        self.existing.clear();
        self.failed.store(false, Ordering::SeqCst);
        self.cleanup = self.adaptor.get_bool(P_CLEANUP, false) && ctx.can_cleanup();
        if self.cleanup {
            ctx.add_listener(Arc::new(ErrorFlag(Arc::clone(&self.failed))));
            self.existing = WalkDir::new(&broker_root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect();
        }
        self.broker_root = Some(broker_root);
        Ok(())
    }

    async fn publish(&mut self, data: &DataReference) -> Result<PublishingStatus> {
        let broker_root = self.broker_root.as_ref().ok_or_else(|| {
            HarvestError::output(TYPE, &data.id, "folder broker used before initialization")
        })?;
        let path = file_path(broker_root, data);
        let created = !path.exists();

        let write = |path: &Path| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &data.content)
        };
        write(&path).map_err(|e| {
            HarvestError::output(
                TYPE,
                &data.id,
                format!("error writing {}", path.display()),
            )
            .with_source(e)
        })?;
        self.existing.remove(&path);

        Ok(if created {
            PublishingStatus::CREATED
        } else {
            PublishingStatus::UPDATED
        })
    }

    async fn terminate(&mut self) -> Result<()> {
        if !self.cleanup {
            return Ok(());
        }
        if self.failed.load(Ordering::SeqCst) {
            info!(root = ?self.broker_root, "errors during harvest; cleanup skipped");
            return Ok(());
        }
        let mut removed = 0usize;
        for file in self.existing.drain() {
            match std::fs::remove_file(&file) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %file.display(), error = %e, "error deleting file"),
            }
        }
        info!(removed, "records removed during cleanup");
        Ok(())
    }
}

fn sanitize(segment: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let re = INVALID.get_or_init(|| Regex::new(r"[^a-zA-Z0-9._{}-]+").expect("valid pattern"));
    re.replace_all(segment, "_").into_owned()
}

/// Path segments that are safe to join under a folder.
fn safe_segments<'a>(segments: impl Iterator<Item = &'a str>) -> Vec<String> {
    segments
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(sanitize)
        .collect()
}

/// Folder segments for the input broker `TYPE:<scheme specific part>`: the
/// host of the scheme specific part, or its path segments.
pub fn broker_root_segments(broker_uri: &str) -> Vec<String> {
    let ssp = broker_uri.split_once(':').map(|(_, s)| s).unwrap_or(broker_uri);
    if ssp.contains("://") {
        if let Ok(url) = Url::parse(ssp) {
            if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
                return safe_segments(std::iter::once(host));
            }
            return safe_segments(url.path().split('/'));
        }
    }
    safe_segments(ssp.split(['/', '\\']))
}

/// Target file for `data` under `broker_root`.
pub fn file_path(broker_root: &Path, data: &DataReference) -> PathBuf {
    let root_segments = broker_root_segments(&data.broker_uri);
    let mut segments = safe_segments(data.source_uri.path().split('/'));

    // drop the part of the source path the broker root already names
    if data.source_uri.host_str().is_some_and(|h| !h.is_empty()) {
        if segments.len() > 1 && segments.first() == root_segments.first() {
            segments.remove(0);
        }
    } else if !root_segments.is_empty() && segments.starts_with(&root_segments) {
        segments.drain(..root_segments.len());
    }

    if segments.is_empty() {
        segments.push(sanitize(&data.id));
    }

    let extension = data
        .content_type
        .as_ref()
        .and_then(|ct| ct.extensions().first().copied());
    if let (Some(ext), Some(last)) = (extension, segments.last_mut()) {
        let suffix = format!(".{}", ext);
        if !last.to_ascii_lowercase().ends_with(&suffix) {
            last.push_str(&suffix);
        }
    }

    let mut path = broker_root.to_path_buf();
    path.extend(segments);
    path
}
