/// Build Context Assembler
///
/// **Responsibility:**
/// Turn an execution request into the compressed tar stream the runtime's
/// build API consumes.
///
/// Files are staged in a temporary directory private to the request (its name
/// is prefixed with the request id) and archived from there. The staging area
/// is removed before `assemble` returns, on success and on failure.

use crate::error::SandboxError;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use runbox_common::config::SandboxConfig;
use runbox_common::types::ExecutionRequest;
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Entry name the runtime looks for when building
pub const DESCRIPTOR_NAME: &str = "Dockerfile";

const ENTRY_MODE: u32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// Ordered, uniquely named set of files handed to the image build
#[derive(Debug, Clone)]
pub struct BuildContext {
    entries: Vec<ContextEntry>,
    names: HashSet<String>,
    total_bytes: usize,
    max_bytes: usize,
}

impl BuildContext {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: Vec::new(),
            names: HashSet::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Descriptor first, then the source text
    pub fn from_request(request: &ExecutionRequest, max_bytes: usize) -> Result<Self, SandboxError> {
        if request.build_descriptor.is_empty() {
            return Err(SandboxError::Assembly("build descriptor is empty".to_string()));
        }

        let mut context = Self::new(max_bytes);
        context.add(DESCRIPTOR_NAME, request.build_descriptor.clone())?;
        context.add(&request.source_name, request.source_text.as_bytes().to_vec())?;
        Ok(context)
    }

    pub fn add(&mut self, name: &str, data: Vec<u8>) -> Result<(), SandboxError> {
        validate_entry_name(name)?;
        if self.names.contains(name) {
            return Err(SandboxError::Assembly(format!(
                "duplicate build context entry '{}'",
                name
            )));
        }

        let total = self.total_bytes + data.len();
        if total > self.max_bytes {
            return Err(SandboxError::Assembly(format!(
                "build context exceeds {} bytes",
                self.max_bytes
            )));
        }

        self.names.insert(name.to_string());
        self.total_bytes = total;
        self.entries.push(ContextEntry {
            name: name.to_string(),
            data,
        });
        Ok(())
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

/// Entry names are relative paths that stay inside the context root
fn validate_entry_name(name: &str) -> Result<(), SandboxError> {
    let path = Path::new(name);
    let escapes = name.is_empty()
        || name.contains('\\')
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));

    if escapes {
        return Err(SandboxError::Assembly(format!(
            "invalid build context entry name '{}'",
            name
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    staging_root: PathBuf,
    max_source_bytes: usize,
    max_context_bytes: usize,
}

impl ContextAssembler {
    pub fn new(staging_root: impl Into<PathBuf>, max_source_bytes: usize, max_context_bytes: usize) -> Self {
        Self {
            staging_root: staging_root.into(),
            max_source_bytes,
            max_context_bytes,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(
            config.staging_root(),
            config.max_source_bytes,
            config.max_context_bytes,
        )
    }

    /// Produce the gzip-compressed tar archive for a request
    pub fn assemble(&self, request: &ExecutionRequest) -> Result<Bytes, SandboxError> {
        request.validate_id().map_err(SandboxError::Assembly)?;

        if request.source_text.len() > self.max_source_bytes {
            return Err(SandboxError::Assembly(format!(
                "source text exceeds maximum size of {} bytes",
                self.max_source_bytes
            )));
        }

        let context = BuildContext::from_request(request, self.max_context_bytes)?;

        let staging = tempfile::Builder::new()
            .prefix(&request.staging_prefix())
            .tempdir_in(&self.staging_root)
            .map_err(|e| {
                SandboxError::Assembly(format!(
                    "failed to create staging area under {}: {}",
                    self.staging_root.display(),
                    e
                ))
            })?;

        let archive = stage(&context, staging.path()).and_then(|_| archive(&context, staging.path()));

        let staging_path = staging.path().to_path_buf();
        if let Err(e) = staging.close() {
            warn!(
                execution_id = %request.id,
                path = %staging_path.display(),
                error = %e,
                "Failed to remove staging area"
            );
        }

        let archive = archive?;
        debug!(
            execution_id = %request.id,
            entries = context.entries().len(),
            context_bytes = context.total_bytes(),
            archive_bytes = archive.len(),
            "Build context assembled"
        );
        Ok(Bytes::from(archive))
    }
}

fn stage(context: &BuildContext, root: &Path) -> Result<(), SandboxError> {
    for entry in context.entries() {
        let path = root.join(&entry.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &entry.data).map_err(|e| {
            SandboxError::Assembly(format!("failed to write '{}': {}", entry.name, e))
        })?;
    }
    Ok(())
}

fn archive(context: &BuildContext, root: &Path) -> Result<Vec<u8>, SandboxError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in context.entries() {
        let file = File::open(root.join(&entry.name))?;
        let size = file.metadata()?.len();

        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(ENTRY_MODE);
        header.set_mtime(0);
        builder.append_data(&mut header, &entry.name, file)?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}
