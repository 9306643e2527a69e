//! OCI bundles: a directory holding `config.json` and a root filesystem.
//!
//! The launcher only talks to the [`Bundle`] and [`BundleProvider`] traits.
//! [`LayoutBundleProvider`] builds bundles from a local OCI image layout
//! (`oci:<dir>[:<ref>]`).

use crate::cache::ImageCache;
use crate::cancel::CancelToken;
use crate::RuntimeError;
use flate2::read::GzDecoder;
use ocilaunch_schema::image::{
    Descriptor, ImageIndex, ImageManifest, ANNOTATION_REF_NAME, MEDIA_TYPE_INDEX,
};
use ocilaunch_schema::{ImageSpec, Spec, SysContext};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";
const MAX_INDEX_DEPTH: usize = 4;

/// A bundle under construction.
pub trait Bundle: Send {
    /// Materialize the root filesystem and write `spec` as `config.json`.
    fn create(&mut self, spec: &Spec, cancel: &CancelToken) -> Result<(), RuntimeError>;

    /// Image metadata, available once the bundle has been created.
    fn image_spec(&self) -> Option<&ImageSpec>;

    fn path(&self) -> &Path;

    /// Replace `config.json` with `spec`.
    fn update(&mut self, spec: &Spec, cancel: &CancelToken) -> Result<(), RuntimeError>;

    fn rootfs(&self) -> PathBuf {
        self.path().join("rootfs")
    }
}

/// Source of bundles for image references.
pub trait BundleProvider: Send + Sync {
    fn name(&self) -> &str;

    fn new_bundle(
        &self,
        path: &Path,
        image_ref: &str,
        sys_context: &SysContext,
        cache: Option<ImageCache>,
    ) -> Result<Box<dyn Bundle>, RuntimeError>;
}

/// Serialize `spec` to `<bundle>/config.json`.
pub fn write_config(bundle: &Path, spec: &Spec) -> Result<(), RuntimeError> {
    let json = serde_json::to_string_pretty(spec)?;
    fs::write(bundle.join("config.json"), json)
        .map_err(|e| RuntimeError::Bundle(format!("failed to write config.json: {e}")))
}

/// OCI platform name for the host architecture.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// A parsed `oci:<dir>[:<ref>]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutRef {
    pub dir: PathBuf,
    pub reference: Option<String>,
}

impl LayoutRef {
    pub fn parse(image_ref: &str) -> Result<Self, RuntimeError> {
        let rest = image_ref.strip_prefix("oci:").ok_or_else(|| {
            RuntimeError::UnsupportedImage(format!(
                "'{image_ref}': only local OCI layouts (oci:<dir>) are supported"
            ))
        })?;
        if rest.is_empty() {
            return Err(RuntimeError::UnsupportedImage(format!(
                "'{image_ref}': missing layout directory"
            )));
        }
        if Path::new(rest).join("index.json").exists() {
            return Ok(Self {
                dir: PathBuf::from(rest),
                reference: None,
            });
        }
        match rest.rsplit_once(':') {
            Some((dir, reference)) if !dir.is_empty() && !reference.contains('/') => Ok(Self {
                dir: PathBuf::from(dir),
                reference: Some(reference.to_owned()),
            }),
            _ => Ok(Self {
                dir: PathBuf::from(rest),
                reference: None,
            }),
        }
    }
}

/// Builds bundles from local OCI image layouts.
#[derive(Debug, Default)]
pub struct LayoutBundleProvider;

impl BundleProvider for LayoutBundleProvider {
    fn name(&self) -> &str {
        "oci-layout"
    }

    fn new_bundle(
        &self,
        path: &Path,
        image_ref: &str,
        sys_context: &SysContext,
        cache: Option<ImageCache>,
    ) -> Result<Box<dyn Bundle>, RuntimeError> {
        let layout = LayoutRef::parse(image_ref)?;
        Ok(Box::new(LayoutBundle {
            path: path.to_path_buf(),
            layout,
            os: sys_context
                .os_choice
                .clone()
                .unwrap_or_else(|| std::env::consts::OS.to_owned()),
            arch: sys_context
                .arch_choice
                .clone()
                .unwrap_or_else(|| host_architecture().to_owned()),
            cache,
            image: None,
        }))
    }
}

pub struct LayoutBundle {
    path: PathBuf,
    layout: LayoutRef,
    os: String,
    arch: String,
    cache: Option<ImageCache>,
    image: Option<ImageSpec>,
}

impl LayoutBundle {
    fn blob_path(&self, digest: &str) -> Result<PathBuf, RuntimeError> {
        let (algo, hex) = digest.split_once(':').ok_or_else(|| {
            RuntimeError::UnsupportedImage(format!("malformed digest '{digest}'"))
        })?;
        if algo != "sha256" {
            return Err(RuntimeError::UnsupportedImage(format!(
                "unsupported digest algorithm '{algo}'"
            )));
        }
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RuntimeError::UnsupportedImage(format!(
                "malformed digest '{digest}'"
            )));
        }
        Ok(self.layout.dir.join("blobs").join(algo).join(hex))
    }

    /// Open a blob after checking its digest, unless the cache already
    /// vouches for it.
    fn open_verified(&self, desc: &Descriptor) -> Result<File, RuntimeError> {
        let path = self.blob_path(&desc.digest)?;
        let mut file = File::open(&path).map_err(|e| {
            RuntimeError::Bundle(format!("blob {} not readable: {e}", desc.digest))
        })?;

        if self
            .cache
            .as_ref()
            .is_some_and(|c| c.is_verified(&path, &desc.digest))
        {
            debug!("blob {} verified by cache", desc.digest);
            return Ok(file);
        }

        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != desc.digest {
            return Err(RuntimeError::DigestMismatch {
                expected: desc.digest.clone(),
                actual,
            });
        }
        if let Some(cache) = &self.cache {
            let _lock = cache.lock()?;
            cache.mark_verified(&path, &desc.digest)?;
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        desc: &Descriptor,
    ) -> Result<T, RuntimeError> {
        let file = self.open_verified(desc)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    fn platform_matches(&self, desc: &Descriptor) -> bool {
        desc.platform
            .as_ref()
            .map_or(true, |p| p.os == self.os && p.architecture == self.arch)
    }

    fn select_manifest(&self) -> Result<ImageManifest, RuntimeError> {
        let index_path = self.layout.dir.join("index.json");
        let content = fs::read_to_string(&index_path).map_err(|e| {
            RuntimeError::UnsupportedImage(format!(
                "{} is not an OCI image layout: {e}",
                self.layout.dir.display()
            ))
        })?;
        let index: ImageIndex = serde_json::from_str(&content)?;

        let candidates: Vec<&Descriptor> = match &self.layout.reference {
            Some(r) => index
                .manifests
                .iter()
                .filter(|d| d.annotations.get(ANNOTATION_REF_NAME) == Some(r))
                .collect(),
            None => index.manifests.iter().collect(),
        };
        if candidates.is_empty() {
            return Err(RuntimeError::UnsupportedImage(format!(
                "no manifest named '{}' in {}",
                self.layout.reference.as_deref().unwrap_or_default(),
                index_path.display()
            )));
        }
        self.resolve(&candidates, 0)
    }

    fn resolve(
        &self,
        candidates: &[&Descriptor],
        depth: usize,
    ) -> Result<ImageManifest, RuntimeError> {
        if depth > MAX_INDEX_DEPTH {
            return Err(RuntimeError::UnsupportedImage(
                "image index nesting too deep".to_owned(),
            ));
        }
        let desc = candidates
            .iter()
            .find(|d| self.platform_matches(d))
            .ok_or_else(|| {
                RuntimeError::UnsupportedImage(format!(
                    "no manifest for platform {}/{}",
                    self.os, self.arch
                ))
            })?;

        if desc.media_type == MEDIA_TYPE_INDEX {
            let nested: ImageIndex = self.read_json(desc)?;
            let refs: Vec<&Descriptor> = nested.manifests.iter().collect();
            return self.resolve(&refs, depth + 1);
        }
        self.read_json(desc)
    }
}

impl Bundle for LayoutBundle {
    fn create(&mut self, spec: &Spec, cancel: &CancelToken) -> Result<(), RuntimeError> {
        let manifest = self.select_manifest()?;
        let image: ImageSpec = self.read_json(&manifest.config)?;

        let rootfs = self.rootfs();
        fs::create_dir_all(&rootfs)?;
        for layer in &manifest.layers {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            debug!("extracting layer {}", layer.digest);
            let blob = self.open_verified(layer)?;
            extract_layer(blob, &rootfs).map_err(|e| match e {
                RuntimeError::PathTraversal(_) => e,
                other => RuntimeError::Bundle(format!(
                    "failed to extract layer {}: {other}",
                    layer.digest
                )),
            })?;
        }

        write_config(&self.path, spec)?;
        info!(
            "created bundle {} from {}",
            self.path.display(),
            self.layout.dir.display()
        );
        self.image = Some(image);
        Ok(())
    }

    fn image_spec(&self) -> Option<&ImageSpec> {
        self.image.as_ref()
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn update(&mut self, spec: &Spec, cancel: &CancelToken) -> Result<(), RuntimeError> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        write_config(&self.path, spec)
    }
}

fn is_safe_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// `rootfs/rel` when every component of `rel` is a real directory below
/// `rootfs`. A symlink anywhere along the way, or a missing component,
/// yields `None`.
fn real_dir_in(rootfs: &Path, rel: &Path) -> io::Result<Option<PathBuf>> {
    let mut dir = rootfs.to_path_buf();
    for component in rel.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        dir.push(part);
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.file_type().is_dir() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Ok(Some(dir))
}

/// Apply one layer tarball (gzip or plain) on top of `rootfs`.
///
/// Whiteout entries delete what earlier layers put there; an opaque
/// whiteout empties its directory. Device nodes are skipped since `/dev`
/// is always a fresh tmpfs in the container.
pub fn extract_layer<R: Read>(blob: R, rootfs: &Path) -> Result<(), RuntimeError> {
    let mut reader = BufReader::new(blob);
    let mut magic = [0u8; 2];
    let peeked = {
        let buf = io::BufRead::fill_buf(&mut reader)?;
        let n = buf.len().min(2);
        magic[..n].copy_from_slice(&buf[..n]);
        n
    };

    if peeked == 2 && magic == [0x1f, 0x8b] {
        unpack(Archive::new(GzDecoder::new(reader)), rootfs)
    } else {
        unpack(Archive::new(reader), rootfs)
    }
}

fn unpack<R: Read>(mut archive: Archive<R>, rootfs: &Path) -> Result<(), RuntimeError> {
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !is_safe_relative(&path) {
            return Err(RuntimeError::PathTraversal(path.display().to_string()));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        if name == WHITEOUT_OPAQUE || name.starts_with(WHITEOUT_PREFIX) {
            let parent = path.parent().unwrap_or_else(|| Path::new(""));
            let Some(parent) = real_dir_in(rootfs, parent)? else {
                warn!("ignoring whiteout {}: parent is not a directory", path.display());
                continue;
            };
            if name == WHITEOUT_OPAQUE {
                for child in fs::read_dir(&parent)? {
                    remove_path(&child?.path())?;
                }
            } else if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
                if matches!(target, "" | "." | "..") {
                    return Err(RuntimeError::PathTraversal(path.display().to_string()));
                }
                remove_path(&parent.join(target))?;
            }
            continue;
        }

        if matches!(
            entry.header().entry_type(),
            EntryType::Block | EntryType::Char | EntryType::Fifo
        ) {
            debug!("skipping device entry {}", path.display());
            continue;
        }

        entry.unpack_in(rootfs)?;
    }
    Ok(())
}
