//! Module extraction and plugin startup.
//!
//! [`Service`] owns the module tree `<root>/src/<module path>`. A module
//! directory it extracted carries a [`MARKER_FILE`] holding the version it
//! was extracted from; a directory without one belongs to the user and is
//! never modified.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::archive;
use super::client::{check_path, Client};
use super::error::{ContractError, ExtractionError, ResolutionError, Result};
use super::instance::PluginInstance;
use super::loader::{PluginLoader, DEFAULT_FUEL_LIMIT};
use super::traits::{Descriptor, Logger, ModuleVersion, PluginInfo, Ui};
use super::vendor;

/// Module path of the kiosk host itself; never extracted as a dependency.
pub const HOST_MODULE_PATH: &str = "github.com/kiosk-dev/kiosk";

/// Marker file inside an engine-managed module directory.
pub const MARKER_FILE: &str = ".kiosk";

/// Outcome of [`Service::extract`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// The descriptor has no version; its tree is managed by the user.
    Skipped,
    /// The target exists without a marker and was left untouched.
    UserOwned { path: PathBuf },
    /// The marker already matches the resolved version.
    Current { path: PathBuf, version: String },
    /// The module was downloaded and unpacked.
    Extracted { path: PathBuf, version: String },
}

/// Extracts modules into the module tree and starts plugins from it.
pub struct Service<C> {
    mod_root: PathBuf,
    client: C,
    host_path: String,
    fuel_limit: u64,
    locks: parking_lot::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl<C: Client> Service<C> {
    pub fn new(mod_root: impl Into<PathBuf>, client: C) -> Self {
        Self {
            mod_root: mod_root.into(),
            client,
            host_path: HOST_MODULE_PATH.to_string(),
            fuel_limit: DEFAULT_FUEL_LIMIT,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Override the module path skipped during dependency extraction.
    pub fn with_host_path(mut self, path: impl Into<String>) -> Self {
        self.host_path = path.into();
        self
    }

    /// Fuel limit applied to every guest call of plugins started by [`run`](Self::run).
    pub fn with_fuel_limit(mut self, limit: u64) -> Self {
        self.fuel_limit = limit;
        self
    }

    pub fn mod_root(&self) -> &Path {
        &self.mod_root
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Directory a module is extracted to.
    pub fn module_dir(&self, path: &str) -> PathBuf {
        self.mod_root.join("src").join(path)
    }

    /// Extract the module a descriptor refers to, then its vendored dependencies.
    pub async fn extract(&self, desc: &Descriptor) -> Result<Extraction> {
        if desc.version.is_empty() {
            tracing::debug!(module = %desc.name, path = %desc.path, "No version set; skipping extraction");
            return Ok(Extraction::Skipped);
        }

        let outcome = self.extract_module(&desc.path, &desc.version).await?;
        match &outcome {
            Extraction::Current { path, version } | Extraction::Extracted { path, version } => {
                let parent = ModuleVersion::new(&desc.path, version);
                self.extract_dependencies(&parent, path).await?;
            }
            Extraction::UserOwned { path } => {
                tracing::warn!(
                    module = %desc.name,
                    path = %path.display(),
                    "Module directory is not managed by kiosk; leaving it untouched"
                );
            }
            Extraction::Skipped => {}
        }
        Ok(outcome)
    }

    fn target_lock(&self, target: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(target.to_path_buf())
            .or_default()
            .clone()
    }

    /// Resolve, compare against the marker, and unpack if needed.
    async fn extract_module(&self, path: &str, reference: &str) -> Result<Extraction> {
        check_path(path)?;
        let module = self.client.version(path, reference).await?;

        let target = self.module_dir(path);
        let lock = self.target_lock(&target);
        let _guard = lock.lock().await;

        let marker = target.join(MARKER_FILE);
        if tokio::fs::try_exists(&target)
            .await
            .map_err(|e| ExtractionError::io("could not stat", &target, e))?
        {
            match tokio::fs::read(&marker).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(Extraction::UserOwned { path: target });
                }
                Err(e) => return Err(ExtractionError::io("could not read marker", marker, e).into()),
                Ok(current) if current == module.version.as_bytes() => {
                    tracing::debug!(module = %module, "Module is up to date");
                    return Ok(Extraction::Current {
                        path: target,
                        version: module.version,
                    });
                }
                Ok(current) => {
                    tracing::info!(
                        path = %module.path,
                        from = %String::from_utf8_lossy(&current),
                        to = %module.version,
                        "Replacing module version"
                    );
                    tokio::fs::remove_dir_all(&target)
                        .await
                        .map_err(|e| ExtractionError::io("could not remove", &target, e))?;
                }
            }
        }

        let mut reader = self.client.download(&module).await?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|source| ResolutionError::Body {
                path: module.path.clone(),
                version: module.version.clone(),
                source,
            })?;
        drop(reader);

        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| ExtractionError::io("could not create", &target, e))?;

        if let Err(e) = unpack(data, module.clone(), target.clone()).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&target).await {
                tracing::warn!(path = %target.display(), error = %cleanup, "Could not remove partial module");
            }
            return Err(e.into());
        }

        tracing::info!(module = %module, path = %target.display(), "Extracted module");
        Ok(Extraction::Extracted {
            path: target,
            version: module.version,
        })
    }

    async fn extract_dependencies(&self, parent: &ModuleVersion, root: &Path) -> Result<()> {
        for dep in vendor::dependencies(root).await? {
            if dep.path == self.host_path {
                continue;
            }
            let outcome = self
                .extract_module(&dep.path, &dep.version)
                .await
                .map_err(|e| ExtractionError::Dependency {
                    parent: parent.to_string(),
                    path: dep.path.clone(),
                    version: dep.version.clone(),
                    source: Box::new(e),
                })?;
            if let Extraction::UserOwned { path } = outcome {
                tracing::warn!(
                    parent = %parent,
                    dependency = %dep,
                    path = %path.display(),
                    "Dependency directory is not managed by kiosk; leaving it untouched"
                );
            }
        }
        Ok(())
    }

    /// Entry module of a descriptor: `<alias>.wasm`, else `<alias>.wat`.
    fn entry_module(&self, dir: &Path, alias: &str) -> PathBuf {
        let wasm = dir.join(format!("{alias}.wasm"));
        if wasm.is_file() {
            return wasm;
        }
        let wat = dir.join(format!("{alias}.wat"));
        if wat.is_file() {
            return wat;
        }
        wasm
    }

    /// Load the extracted module of `desc` and construct the plugin.
    pub fn run(
        &self,
        ctx: &CancellationToken,
        desc: &Descriptor,
        ui: Arc<dyn Ui>,
        logger: Arc<dyn Logger>,
    ) -> Result<PluginInstance> {
        desc.validate()?;
        check_path(&desc.path)?;

        let dir = self.module_dir(&desc.path);
        let entry = self.entry_module(&dir, desc.import_alias());
        let path = std::path::absolute(&dir).map_err(|e| ContractError::Import {
            name: desc.name.clone(),
            path: desc.path.clone(),
            reason: e.to_string(),
        })?;
        let info = PluginInfo {
            name: desc.name.clone(),
            path,
        };

        let loader = PluginLoader::new(&desc.name, &entry, desc.config.clone())
            .with_fuel_limit(self.fuel_limit);
        if !loader.module_exists() {
            return Err(ContractError::Import {
                name: desc.name.clone(),
                path: desc.path.clone(),
                reason: format!("entry module not found: {}", entry.display()),
            }
            .into());
        }

        tracing::info!(module = %desc.name, entry = %entry.display(), "Starting plugin");
        loader.load(ctx, &info, ui, logger)
    }
}

/// Unzip and write the marker on a blocking thread.
async fn unpack(data: Vec<u8>, module: ModuleVersion, target: PathBuf) -> Result<(), ExtractionError> {
    tokio::task::spawn_blocking(move || -> Result<(), ExtractionError> {
        let files = archive::unzip(&data, &module, &target)?;
        tracing::debug!(module = %module, files, "Unpacked module archive");
        let marker = target.join(MARKER_FILE);
        std::fs::write(&marker, module.version.as_bytes())
            .map_err(|e| ExtractionError::io("could not write marker", marker, e))
    })
    .await
    .map_err(|e| ExtractionError::Task(e.to_string()))?
}

impl<C> std::fmt::Debug for Service<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("mod_root", &self.mod_root)
            .field("host_path", &self.host_path)
            .field("fuel_limit", &self.fuel_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::archive::tests::spoof_declared_size;
    use crate::plugins::error::Error;
    use crate::plugins::cache::tests::{zip_bytes, MockClient};
    use crate::plugins::loader::tests::{
        plugin_wat, RecordingLogger, RecordingUi, BAD_RETURN_NEW, NEW_CONFIG, VALID_NEW,
    };
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<MockClient>, Service<Arc<MockClient>>) {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockClient::default());
        let service = Service::new(dir.path(), mock.clone());
        (dir, mock, service)
    }

    fn desc(version: &str) -> Descriptor {
        Descriptor {
            name: "test".into(),
            path: "test-module".into(),
            version: version.into(),
            ..Descriptor::default()
        }
    }

    fn serve_test_module(mock: &MockClient, version: &str, files: &[(&str, &[u8])]) {
        let prefix = format!("test-module@{version}/");
        let names: Vec<String> = files.iter().map(|(n, _)| format!("{prefix}{n}")).collect();
        let entries: Vec<(&str, &[u8])> = names
            .iter()
            .zip(files)
            .map(|(n, (_, data))| (n.as_str(), *data))
            .collect();
        mock.serve("test-module", version, zip_bytes(&entries));
    }

    /// Every file below `root` with its contents, in path order.
    fn snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        fn walk(dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(&path, out);
                } else {
                    let data = std::fs::read(&path).unwrap();
                    out.push((path, data));
                }
            }
        }
        let mut files = Vec::new();
        walk(root, &mut files);
        files.sort();
        files
    }

    #[tokio::test]
    async fn empty_version_is_skipped() {
        let (_dir, mock, service) = setup();
        assert_eq!(service.extract(&desc("")).await.unwrap(), Extraction::Skipped);
        assert_eq!(mock.version_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn extracts_module_and_writes_marker() {
        let (dir, mock, service) = setup();
        mock.resolve("test-module", "main", "v0.1.0");
        serve_test_module(&mock, "v0.1.0", &[("main.go", b"test-module\n")]);

        let outcome = service.extract(&desc("main")).await.unwrap();

        let target = dir.path().join("src/test-module");
        assert_eq!(
            outcome,
            Extraction::Extracted {
                path: target.clone(),
                version: "v0.1.0".into()
            }
        );
        assert_eq!(std::fs::read_to_string(target.join("main.go")).unwrap(), "test-module\n");
        assert_eq!(std::fs::read_to_string(target.join(MARKER_FILE)).unwrap(), "v0.1.0");
    }

    #[tokio::test]
    async fn second_extract_does_not_download() {
        let (dir, mock, service) = setup();
        mock.resolve("test-module", "main", "v0.1.0");
        serve_test_module(&mock, "v0.1.0", &[("main.go", b"test-module\n")]);

        service.extract(&desc("main")).await.unwrap();
        let before = snapshot(&dir.path().join("src"));
        let outcome = service.extract(&desc("main")).await.unwrap();

        assert!(matches!(outcome, Extraction::Current { ref version, .. } if version == "v0.1.0"));
        assert_eq!(mock.downloads(), 1);
        assert_eq!(snapshot(&dir.path().join("src")), before);
    }

    #[tokio::test]
    async fn concurrent_extracts_download_once() {
        let (_dir, mock, service) = setup();
        mock.resolve("test-module", "main", "v0.1.0");
        serve_test_module(&mock, "v0.1.0", &[("main.go", b"test-module\n")]);

        let d = desc("main");
        let (a, b) = tokio::join!(service.extract(&d), service.extract(&d));

        let mut outcomes = [a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, Extraction::Current { .. }));
        assert!(matches!(outcomes[0], Extraction::Extracted { .. }));
        assert!(matches!(outcomes[1], Extraction::Current { .. }));
        assert_eq!(mock.downloads(), 1);
    }

    #[tokio::test]
    async fn new_version_replaces_tree() {
        let (dir, mock, service) = setup();
        mock.resolve("test-module", "main", "v0.1.0");
        serve_test_module(&mock, "v0.1.0", &[("main.go", b"test-module\n")]);
        service.extract(&desc("main")).await.unwrap();

        mock.resolve("test-module", "main", "v0.2.0");
        serve_test_module(&mock, "v0.2.0", &[("clock.go", b"v2\n")]);
        let outcome = service.extract(&desc("main")).await.unwrap();

        let target = dir.path().join("src/test-module");
        assert!(matches!(outcome, Extraction::Extracted { ref version, .. } if version == "v0.2.0"));
        assert!(!target.join("main.go").exists());
        assert_eq!(std::fs::read_to_string(target.join("clock.go")).unwrap(), "v2\n");
        assert_eq!(std::fs::read_to_string(target.join(MARKER_FILE)).unwrap(), "v0.2.0");
        assert_eq!(mock.downloads(), 2);
    }

    #[tokio::test]
    async fn user_owned_tree_is_preserved() {
        let (dir, mock, service) = setup();
        mock.resolve("test-module", "main", "v0.1.0");
        serve_test_module(&mock, "v0.1.0", &[("main.go", b"test-module\n")]);
        let target = dir.path().join("src/test-module");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("main.go"), "mine\n").unwrap();

        let outcome = service.extract(&desc("main")).await.unwrap();

        assert_eq!(outcome, Extraction::UserOwned { path: target.clone() });
        assert_eq!(std::fs::read_to_string(target.join("main.go")).unwrap(), "mine\n");
        assert!(!target.join(MARKER_FILE).exists());
        assert_eq!(mock.downloads(), 0);
    }

    #[tokio::test]
    async fn escaping_entry_fails_and_cleans_up() {
        let (dir, mock, service) = setup();
        mock.resolve("test-module", "main", "v0.1.0");
        mock.serve(
            "test-module",
            "v0.1.0",
            zip_bytes(&[
                ("test-module@v0.1.0/main.go", b"test-module\n"),
                ("test-module@v0.1.0/../../../escape.txt", b"pwned"),
            ]),
        );

        let err = service.extract(&desc("main")).await.unwrap_err();

        assert!(matches!(err, Error::Extraction(ExtractionError::UnsafePath { .. })));
        assert!(!dir.path().join("escape.txt").exists());
        assert!(!dir.path().join("src/test-module").exists());
    }

    #[tokio::test]
    async fn oversized_entry_fails_and_retry_starts_clean() {
        let (dir, mock, service) = setup();
        mock.resolve("test-module", "main", "v0.1.0");
        let archive = zip_bytes(&[("test-module@v0.1.0/main.go", b"test-module\n")]);
        mock.serve("test-module", "v0.1.0", spoof_declared_size(archive, 4));

        let err = service.extract(&desc("main")).await.unwrap_err();
        assert!(
            matches!(err, Error::Extraction(ExtractionError::SizeMismatch { declared: 4, .. })),
            "{err}"
        );
        let target = dir.path().join("src/test-module");
        assert!(!target.exists());

        serve_test_module(&mock, "v0.1.0", &[("main.go", b"test-module\n")]);
        let outcome = service.extract(&desc("main")).await.unwrap();
        assert!(matches!(outcome, Extraction::Extracted { .. }));
    }

    #[tokio::test]
    async fn vendored_dependencies_are_extracted() {
        let (dir, mock, service) = setup();
        let manifest = format!(
            "# dep-module v1.2.3\n## explicit\ndep-module/widget\n# {HOST_MODULE_PATH} v1.0.0\n"
        );
        mock.resolve("test-module", "main", "v0.1.0");
        serve_test_module(
            &mock,
            "v0.1.0",
            &[("main.go", b"test-module\n"), ("vendor/modules.txt", manifest.as_bytes())],
        );
        mock.resolve("dep-module", "v1.2.3", "v1.2.3");
        mock.serve(
            "dep-module",
            "v1.2.3",
            zip_bytes(&[("dep-module@v1.2.3/widget/widget.go", b"dep\n")]),
        );

        service.extract(&desc("main")).await.unwrap();

        let dep = dir.path().join("src/dep-module");
        assert_eq!(std::fs::read_to_string(dep.join("widget/widget.go")).unwrap(), "dep\n");
        assert_eq!(std::fs::read_to_string(dep.join(MARKER_FILE)).unwrap(), "v1.2.3");
        assert!(!dir.path().join("src").join(HOST_MODULE_PATH).exists());
        assert_eq!(mock.downloads(), 2);

        // Current roots still walk their dependencies; nothing new to fetch.
        service.extract(&desc("main")).await.unwrap();
        assert_eq!(mock.downloads(), 2);
    }

    #[tokio::test]
    async fn dependency_failure_names_parent() {
        let (_dir, mock, service) = setup();
        mock.resolve("test-module", "main", "v0.1.0");
        serve_test_module(
            &mock,
            "v0.1.0",
            &[("vendor/modules.txt", b"# dep-module v1.2.3\n")],
        );

        let err = service.extract(&desc("main")).await.unwrap_err();

        match err {
            Error::Extraction(ExtractionError::Dependency { parent, path, version, .. }) => {
                assert_eq!(parent, "test-module@v0.1.0");
                assert_eq!(path, "dep-module");
                assert_eq!(version, "v1.2.3");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn invalid_path_is_rejected_before_resolution() {
        let (_dir, mock, service) = setup();
        let mut d = desc("main");
        d.path = "../outside".into();

        let err = service.extract(&d).await.unwrap_err();

        assert!(matches!(err, Error::Resolution(ResolutionError::InvalidPath { .. })));
        assert_eq!(mock.version_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    fn write_plugin(service: &Service<Arc<MockClient>>, path: &str, file: &str, exports: &[&str]) {
        let dir = service.module_dir(path);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), plugin_wat(exports)).unwrap();
    }

    #[test]
    fn run_starts_plugin_from_module_tree() {
        let (dir, _mock, service) = setup();
        write_plugin(&service, "github.com/acme/kiosk-clock", "clock.wat", &[NEW_CONFIG, VALID_NEW]);
        let d = Descriptor {
            name: "clock".into(),
            path: "github.com/acme/kiosk-clock".into(),
            ..Descriptor::default()
        };
        let ui = Arc::new(RecordingUi::default());
        let logger = Arc::new(RecordingLogger::default());

        let mut plugin = service
            .run(&CancellationToken::new(), &d, ui.clone(), logger.clone())
            .unwrap();

        assert_eq!(plugin.name(), "clock");
        let identity: serde_json::Value = serde_json::from_str(&logger.infos.lock()[0]).unwrap();
        let expected = std::path::absolute(dir.path().join("src/github.com/acme/kiosk-clock")).unwrap();
        assert_eq!(identity["path"], expected.display().to_string());
        plugin.close().unwrap();
    }

    #[test]
    fn run_honours_package_alias() {
        let (_dir, _mock, service) = setup();
        write_plugin(&service, "github.com/acme/kiosk-clock", "timer.wat", &[NEW_CONFIG, VALID_NEW]);
        let d = Descriptor {
            name: "clock".into(),
            path: "github.com/acme/kiosk-clock".into(),
            package: Some("timer".into()),
            ..Descriptor::default()
        };

        let plugin = service.run(
            &CancellationToken::new(),
            &d,
            Arc::new(RecordingUi::default()),
            Arc::new(RecordingLogger::default()),
        );
        assert!(plugin.is_ok());
    }

    #[test]
    fn run_rejects_wrong_contract() {
        let (_dir, _mock, service) = setup();
        write_plugin(&service, "test-module", "module.wat", &[NEW_CONFIG, BAD_RETURN_NEW]);
        let ui = Arc::new(RecordingUi::default());

        let err = service
            .run(
                &CancellationToken::new(),
                &desc(""),
                ui.clone(),
                Arc::new(RecordingLogger::default()),
            )
            .unwrap_err();

        assert!(matches!(err, Error::Contract(ContractError::Signature { .. })));
        assert!(ui.html.lock().is_empty());
    }

    #[test]
    fn run_without_entry_module_is_import_error() {
        let (_dir, _mock, service) = setup();
        let err = service
            .run(
                &CancellationToken::new(),
                &desc(""),
                Arc::new(RecordingUi::default()),
                Arc::new(RecordingLogger::default()),
            )
            .unwrap_err();
        match err {
            Error::Contract(ContractError::Import { name, reason, .. }) => {
                assert_eq!(name, "test");
                assert!(reason.starts_with("entry module not found"), "{reason}");
                assert!(reason.contains("module.wasm"), "{reason}");
            }
            other => panic!("expected import error, got {other}"),
        }
    }
}
