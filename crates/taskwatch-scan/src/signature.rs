//! Signature checks backed by the distribution's package databases.
//!
//! Linux has no per-file code signatures, so "signed" means the file is owned
//! by the package manager (the package archive was signed when installed) or
//! lives inside a signed third-party channel such as snap or Flatpak.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use taskwatch_core::{Result, SignatureStatus, TaskwatchError};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Decides the signature status of a file on disk.
pub trait SignatureVerifier: Send + Sync + 'static {
    fn verify(&self, path: &Path) -> Result<SignatureStatus>;
}

/// Where the package databases and third-party channels live.
#[derive(Debug, Clone, Default)]
pub struct PackageSources {
    /// dpkg `*.list` manifests
    pub dpkg_info: Option<PathBuf>,
    /// pacman local database (`<pkg>-<ver>/files`)
    pub pacman_local: Option<PathBuf>,
    /// Additional manifests, one absolute path per line, named after the
    /// package that owns them
    pub extra_manifests: Vec<PathBuf>,
    /// Snap mount root
    pub snap_root: Option<PathBuf>,
    /// Flatpak application deployment roots
    pub flatpak_roots: Vec<PathBuf>,
}

impl PackageSources {
    /// Standard locations on a Linux host.
    #[must_use]
    pub fn system() -> Self {
        let mut flatpak_roots = vec![PathBuf::from("/var/lib/flatpak/app")];
        if let Some(home) = std::env::var_os("HOME") {
            flatpak_roots.push(PathBuf::from(home).join(".local/share/flatpak/app"));
        }
        Self {
            dpkg_info: Some(PathBuf::from("/var/lib/dpkg/info")),
            pacman_local: Some(PathBuf::from("/var/lib/pacman/local")),
            extra_manifests: Vec::new(),
            snap_root: Some(PathBuf::from("/snap")),
            flatpak_roots,
        }
    }
}

struct Package {
    name: String,
    manifest_modified: Option<SystemTime>,
}

#[derive(Default)]
struct PackageIndex {
    packages: Vec<Package>,
    owners: HashMap<PathBuf, usize>,
}

impl PackageIndex {
    fn build(sources: &PackageSources) -> Self {
        let mut index = Self::default();
        if let Some(dir) = &sources.dpkg_info {
            index.load_dpkg(dir);
        }
        if let Some(dir) = &sources.pacman_local {
            index.load_pacman(dir);
        }
        for manifest in &sources.extra_manifests {
            let name = manifest
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            index.load_manifest(name, manifest, |line| {
                line.starts_with('/').then(|| PathBuf::from(line))
            });
        }
        debug!(
            packages = index.packages.len(),
            files = index.owners.len(),
            "package index built"
        );
        index
    }

    fn load_dpkg(&mut self, dir: &Path) {
        if !dir.is_dir() {
            return;
        }
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("list") {
                continue;
            }
            // libc6:amd64.list
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy())
                .and_then(|s| s.split(':').next().map(str::to_string))
                .unwrap_or_default();
            self.load_manifest(name, path, |line| {
                (line.starts_with('/') && line != "/.").then(|| PathBuf::from(line))
            });
        }
    }

    fn load_pacman(&mut self, dir: &Path) {
        if !dir.is_dir() {
            return;
        }
        for entry in WalkDir::new(dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file() && e.file_name() == "files")
        {
            let files = entry.path();
            let Some(pkg_dir) = files.parent() else {
                continue;
            };
            let name = pacman_name(pkg_dir);
            let mut in_files = false;
            self.load_manifest(name, files, |line| {
                if line.starts_with('%') {
                    in_files = line == "%FILES%";
                    return None;
                }
                // Directories end with '/'
                (in_files && !line.ends_with('/')).then(|| Path::new("/").join(line))
            });
        }
    }

    fn load_manifest(
        &mut self,
        name: String,
        manifest: &Path,
        mut parse: impl FnMut(&str) -> Option<PathBuf>,
    ) {
        let contents = match fs::read_to_string(manifest) {
            Ok(c) => c,
            Err(e) => {
                debug!(path = %manifest.display(), error = %e, "skipping package manifest");
                return;
            }
        };
        let id = self.packages.len();
        self.packages.push(Package {
            name,
            manifest_modified: fs::metadata(manifest).and_then(|m| m.modified()).ok(),
        });
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(path) = parse(line) {
                self.owners.entry(path).or_insert(id);
            }
        }
    }

    /// Owner of `path`, also trying the merged-/usr alias (`/bin` vs `/usr/bin`).
    fn owner(&self, path: &Path) -> Option<&Package> {
        let id = self.owners.get(path).or_else(|| {
            let alias = match path.strip_prefix("/usr") {
                Ok(rest) => Path::new("/").join(rest),
                Err(_) => Path::new("/usr").join(path.strip_prefix("/").ok()?),
            };
            self.owners.get(&alias)
        })?;
        self.packages.get(*id)
    }
}

/// Package name from a pacman db directory: `%NAME%` in `desc`, falling back
/// to the directory name without its `-<ver>-<rel>` suffix.
fn pacman_name(pkg_dir: &Path) -> String {
    if let Ok(desc) = fs::read_to_string(pkg_dir.join("desc")) {
        let mut lines = desc.lines().map(str::trim);
        while let Some(line) = lines.next() {
            if line == "%NAME%" {
                if let Some(name) = lines.next().filter(|n| !n.is_empty()) {
                    return name.to_string();
                }
            }
        }
    }
    let dir = pkg_dir
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match dir.rsplitn(3, '-').nth(2) {
        Some(name) => name.to_string(),
        None => dir,
    }
}

/// Verifier that consults dpkg/pacman ownership and snap/Flatpak locations.
///
/// The package index is built on first use and read-only afterwards, so a
/// single verifier can be shared by every hashing worker.
pub struct PackageDbVerifier {
    sources: PackageSources,
    index: OnceLock<PackageIndex>,
}

impl Default for PackageDbVerifier {
    fn default() -> Self {
        Self::new(PackageSources::system())
    }
}

impl PackageDbVerifier {
    #[must_use]
    pub const fn new(sources: PackageSources) -> Self {
        Self {
            sources,
            index: OnceLock::new(),
        }
    }

    fn index(&self) -> &PackageIndex {
        self.index.get_or_init(|| PackageIndex::build(&self.sources))
    }

    /// Signer for paths inside a snap or Flatpak deployment.
    fn third_party_signer(&self, path: &Path) -> Option<String> {
        if let Some(root) = &self.sources.snap_root {
            if let Some(name) = first_component(path, root) {
                return Some(format!("snap:{name}"));
            }
        }
        self.sources
            .flatpak_roots
            .iter()
            .find_map(|root| first_component(path, root))
            .map(|id| format!("flatpak:{id}"))
    }
}

fn first_component(path: &Path, root: &Path) -> Option<String> {
    match path.strip_prefix(root).ok()?.components().next()? {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    }
}

impl SignatureVerifier for PackageDbVerifier {
    fn verify(&self, path: &Path) -> Result<SignatureStatus> {
        let meta = fs::metadata(path).map_err(|e| TaskwatchError::read(path, e))?;

        if let Some(signer) = self.third_party_signer(path) {
            return Ok(SignatureStatus::ThirdPartySigned { signer });
        }

        let Some(package) = self.index().owner(path) else {
            return Ok(SignatureStatus::Unsigned);
        };

        let modified = meta.modified().ok();
        if let (Some(file), Some(manifest)) = (modified, package.manifest_modified) {
            if file > manifest {
                warn!(
                    path = %path.display(),
                    package = %package.name,
                    "package-owned file changed after install"
                );
                return Ok(SignatureStatus::Invalid {
                    reason: format!("modified after package {} was installed", package.name),
                });
            }
        }

        Ok(SignatureStatus::PlatformSigned {
            package: package.name.clone(),
        })
    }
}
