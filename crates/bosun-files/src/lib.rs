//! The per-plan artifact cache.
//!
//! Every plan run owns one directory under `<storage>/files/<plan id>/`.
//! Declared files are materialised into it on first use - inline bodies
//! written directly, downloadables fetched over HTTP, git, or svn - and
//! exposed to each script through a symlink tree under
//! `<cache>/<script name>/`. The cache is reset when the manager is built
//! and removed by [`FilesManager::clear`] when the runner is disposed.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use tracing::{debug, error, warn};
use url::Url;

use bosun_exec::{ShellCommand, run_shell};
use bosun_types::{ExecutionPlan, FileRef, FileSpec};

/// Materialises plan files into one plan-scoped cache directory.
#[derive(Debug)]
pub struct FilesManager {
    cache_dir: PathBuf,
    files: BTreeMap<String, FileSpec>,
    fetched: BTreeMap<String, PathBuf>,
}

impl FilesManager {
    /// Create the cache for a plan, resetting any leftovers from a previous
    /// run of the same plan id.
    pub fn new(storage: &Path, plan: &ExecutionPlan) -> Result<Self> {
        let plan_id = plan
            .id
            .as_deref()
            .context("execution plan has no ID; cannot build a files cache")?;
        let cache_dir = storage.join("files").join(plan_id);

        if cache_dir.exists() {
            std::fs::remove_dir_all(&cache_dir).with_context(|| {
                format!("failed to reset files cache {}", cache_dir.display())
            })?;
        }
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("failed to create files cache {}", cache_dir.display()))?;
        restrict_permissions(&cache_dir)?;

        Ok(Self {
            cache_dir,
            files: plan.files.clone(),
            fetched: BTreeMap::new(),
        })
    }

    /// The plan-scoped cache root.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The symlink tree prepared for one script.
    pub fn script_dir(&self, script: &str) -> PathBuf {
        self.cache_dir.join(script)
    }

    /// Materialise one file reference for a script and return the symlink
    /// path the script should use.
    pub fn put_file(&mut self, file_ref: &FileRef, script: &str) -> Result<PathBuf> {
        let (file_id, alias) = match file_ref {
            FileRef::Id(id) => (id.as_str(), None),
            FileRef::Alias(map) => {
                let (name, id) = map
                    .iter()
                    .next()
                    .map(|(name, id)| (name.as_str(), id.as_str()))
                    .context("aliased file reference is empty")?;
                (id, Some(name))
            }
        };

        let spec = self
            .files
            .get(file_id)
            .cloned()
            .with_context(|| format!("file {file_id} is not declared by the plan"))?;
        let file_name = match alias {
            Some(name) => name.to_string(),
            None => spec
                .name
                .clone()
                .with_context(|| format!("file {file_id} has no Name"))?,
        };

        let cache_path = if spec.is_downloadable() {
            self.download(&spec, file_id)?
        } else {
            self.fetch_inline(&spec, file_id)?
        };
        self.make_symlink(&cache_path, &file_name, script)
    }

    /// Remove the whole cache directory. Errors are deliberately ignored;
    /// disposal runs on every exit path.
    pub fn clear(&self) {
        let _ = std::fs::remove_dir_all(&self.cache_dir);
    }

    fn make_symlink(&self, cache_path: &Path, file_name: &str, script: &str) -> Result<PathBuf> {
        let script_dir = self.script_dir(script);
        let link_path = script_dir.join(file_name);
        let link_dir = link_path
            .parent()
            .with_context(|| format!("file name {file_name} has no parent directory"))?;
        std::fs::create_dir_all(link_dir)
            .with_context(|| format!("failed to create script directory {}", link_dir.display()))?;

        if !link_exists(&link_path) {
            make_link(cache_path, &link_path)?;
        }
        Ok(link_path)
    }

    /// Write an inline body to `<cache>/<file id>`, memoised per file id.
    fn fetch_inline(&mut self, spec: &FileSpec, file_id: &str) -> Result<PathBuf> {
        if let Some(path) = self.fetched.get(file_id) {
            return Ok(path.clone());
        }

        let out_path = self.cache_dir.join(file_id);
        let body = spec
            .body
            .as_deref()
            .with_context(|| format!("file {file_id} has no Body"))?;
        match spec.body_type.as_deref().unwrap_or("Text") {
            "Base64" => {
                let bytes = bosun_codec::b64decode_bytes(body)
                    .with_context(|| format!("file {file_id} carries invalid base64"))?;
                std::fs::write(&out_path, bytes)
            }
            _ => std::fs::write(&out_path, body),
        }
        .with_context(|| format!("failed to write file {file_id}"))?;

        self.fetched.insert(file_id.to_string(), out_path.clone());
        Ok(out_path)
    }

    /// Fetch a downloadable into `<cache>/<file id>/`. A folder that already
    /// exists is reused; a failed fetch leaves the partial folder for the
    /// runner's dispose to clean up.
    fn download(&self, spec: &FileSpec, file_id: &str) -> Result<PathBuf> {
        let folder = self.cache_dir.join(file_id);
        if folder.is_dir() {
            return Ok(folder);
        }

        let url = spec
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("no valid URL in file {file_id}"))?;
        if !is_fetchable_url(url) {
            bail!("provided URL is not valid: {url}");
        }
        std::fs::create_dir_all(&folder)
            .with_context(|| format!("failed to create artifact folder {}", folder.display()))?;

        let outcome = if is_git_url(url) {
            clone_git(url, &folder)
                .with_context(|| format!("failed to clone git repository {url}"))
        } else if is_svn_url(url) {
            checkout_svn(url, &folder)
                .with_context(|| format!("failed to check out svn repository {url}"))
        } else {
            fetch_http(url, &folder).with_context(|| format!("failed to download file {url}"))
        };

        match outcome {
            Ok(()) => Ok(folder),
            Err(e) => {
                warn!(url, error = %e, "artifact fetch failed");
                Err(e)
            }
        }
    }
}

/// Does the string look like something we can fetch at all?
fn is_fetchable_url(candidate: &str) -> bool {
    Url::parse(candidate)
        .map(|url| !url.scheme().is_empty())
        .unwrap_or(false)
}

/// Git detection: explicit git schemes, or any URL ending in `.git`.
pub fn is_git_url(url: &str) -> bool {
    url.starts_with("git://")
        || url.starts_with("git+http://")
        || url.starts_with("git+https://")
        || url.ends_with(".git")
}

/// SVN detection: an `/svn/` path segment over HTTP, or the svn scheme.
pub fn is_svn_url(url: &str) -> bool {
    static HTTP_SVN: OnceLock<Regex> = OnceLock::new();
    static SVN: OnceLock<Regex> = OnceLock::new();
    let http_svn = HTTP_SVN.get_or_init(|| Regex::new("https?://(.*)/svn/(.*)").expect("regex"));
    let svn = SVN.get_or_init(|| Regex::new("svn://(.*)").expect("regex"));
    http_svn.is_match(url) || svn.is_match(url)
}

fn clone_git(url: &str, folder: &Path) -> Result<()> {
    which::which("git").context("git executable not found")?;
    let command = format!("git clone {url} {}", folder.display());
    let output = run_shell(&ShellCommand::new(&command, folder))?;
    if output.exit_code != 0 {
        bail!("{}", output.stderr.unwrap_or_default());
    }
    Ok(())
}

fn checkout_svn(url: &str, folder: &Path) -> Result<()> {
    which::which("svn").context("svn executable not found")?;
    let command = format!(
        "svn checkout {url} --non-interactive --trust-server-cert {}",
        folder.display()
    );
    let output = run_shell(&ShellCommand::new(&command, folder))?;
    if let Some(stdout) = &output.stdout {
        debug!(stdout = %stdout, "svn checkout output");
    }
    if let Some(stderr) = &output.stderr
        && !stderr.is_empty()
    {
        error!(stderr = %stderr, "svn checkout errors");
    }
    if output.exit_code != 0 {
        bail!("{}", output.stderr.unwrap_or_default());
    }
    Ok(())
}

/// Stream an HTTP(S) URL to `<folder>/<url basename>` in 1 KiB chunks.
fn fetch_http(url: &str, folder: &Path) -> Result<()> {
    let file_name = url.rsplit('/').next().unwrap_or(url);
    let target = folder.join(file_name);

    let mut response = reqwest::blocking::get(url)
        .with_context(|| format!("request to {url} failed"))?
        .error_for_status()
        .with_context(|| format!("request to {url} was rejected"))?;

    let mut out = std::fs::File::create(&target)
        .with_context(|| format!("failed to create {}", target.display()))?;
    let mut buffer = [0_u8; 1024];
    loop {
        let read = response
            .read(&mut buffer)
            .with_context(|| format!("failed while streaming {url}"))?;
        if read == 0 {
            break;
        }
        out.write_all(&buffer[..read])
            .with_context(|| format!("failed to write {}", target.display()))?;
    }
    Ok(())
}

fn link_exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

#[cfg(unix)]
fn make_link(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("failed to link {} -> {}", link.display(), target.display()))
}

#[cfg(not(unix))]
fn make_link(target: &Path, link: &Path) -> Result<()> {
    std::fs::copy(target, link)
        .map(|_| ())
        .with_context(|| format!("failed to copy {} -> {}", target.display(), link.display()))
}

#[cfg(unix)]
fn restrict_permissions(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to restrict permissions on {}", dir.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_types::ExecutionPlan;
    use tempfile::tempdir;

    fn plan_with_files(files_json: &str) -> ExecutionPlan {
        let doc = format!(
            r#"{{"FormatVersion": "2.1.0", "ID": "plan-1", "Scripts": {{}}, "Files": {files_json}}}"#
        );
        serde_json::from_str(&doc).expect("parse plan")
    }

    #[test]
    fn materialises_text_file_through_symlink() {
        let storage = tempdir().expect("tempdir");
        let plan = plan_with_files(
            r#"{"F1": {"BodyType": "Text", "Body": "echo hi", "Name": "run.sh"}}"#,
        );
        let mut manager = FilesManager::new(storage.path(), &plan).expect("manager");

        let link = manager
            .put_file(&FileRef::Id("F1".into()), "deploy")
            .expect("put");
        assert_eq!(link, manager.script_dir("deploy").join("run.sh"));
        assert_eq!(std::fs::read_to_string(&link).expect("read"), "echo hi");
    }

    #[test]
    fn materialises_base64_file() {
        let storage = tempdir().expect("tempdir");
        let plan = plan_with_files(
            r#"{"F1": {"BodyType": "Base64", "Body": "aGVsbG8=", "Name": "data.bin"}}"#,
        );
        let mut manager = FilesManager::new(storage.path(), &plan).expect("manager");

        let link = manager
            .put_file(&FileRef::Id("F1".into()), "deploy")
            .expect("put");
        assert_eq!(std::fs::read(&link).expect("read"), b"hello");
    }

    #[test]
    fn nested_file_names_create_directories() {
        let storage = tempdir().expect("tempdir");
        let plan = plan_with_files(
            r#"{"F1": {"BodyType": "Text", "Body": "x", "Name": "conf/app/site.conf"}}"#,
        );
        let mut manager = FilesManager::new(storage.path(), &plan).expect("manager");

        let link = manager
            .put_file(&FileRef::Id("F1".into()), "deploy")
            .expect("put");
        assert!(link.ends_with("deploy/conf/app/site.conf"));
        assert_eq!(std::fs::read_to_string(&link).expect("read"), "x");
    }

    #[test]
    fn repeated_put_reuses_existing_link() {
        let storage = tempdir().expect("tempdir");
        let plan =
            plan_with_files(r#"{"F1": {"BodyType": "Text", "Body": "x", "Name": "run.sh"}}"#);
        let mut manager = FilesManager::new(storage.path(), &plan).expect("manager");

        let first = manager
            .put_file(&FileRef::Id("F1".into()), "deploy")
            .expect("put");
        let second = manager
            .put_file(&FileRef::Id("F1".into()), "deploy")
            .expect("put again");
        assert_eq!(first, second);
    }

    #[test]
    fn alias_overrides_file_name() {
        let storage = tempdir().expect("tempdir");
        let plan =
            plan_with_files(r#"{"F1": {"BodyType": "Text", "Body": "x", "Name": "orig.txt"}}"#);
        let mut manager = FilesManager::new(storage.path(), &plan).expect("manager");

        let file_ref: FileRef =
            serde_json::from_str(r#"{"renamed.txt": "F1"}"#).expect("parse ref");
        let link = manager.put_file(&file_ref, "deploy").expect("put");
        assert!(link.ends_with("deploy/renamed.txt"));
    }

    #[test]
    fn unknown_file_id_fails() {
        let storage = tempdir().expect("tempdir");
        let plan = plan_with_files(r#"{}"#);
        let mut manager = FilesManager::new(storage.path(), &plan).expect("manager");
        assert!(manager.put_file(&FileRef::Id("F9".into()), "deploy").is_err());
    }

    #[test]
    fn new_resets_previous_cache() {
        let storage = tempdir().expect("tempdir");
        let plan = plan_with_files(r#"{}"#);
        let stale = storage.path().join("files").join("plan-1").join("stale");
        std::fs::create_dir_all(&stale).expect("mkdir");

        let manager = FilesManager::new(storage.path(), &plan).expect("manager");
        assert!(!stale.exists());
        assert!(manager.cache_dir().is_dir());
    }

    #[test]
    fn clear_removes_cache() {
        let storage = tempdir().expect("tempdir");
        let plan =
            plan_with_files(r#"{"F1": {"BodyType": "Text", "Body": "x", "Name": "run.sh"}}"#);
        let mut manager = FilesManager::new(storage.path(), &plan).expect("manager");
        manager
            .put_file(&FileRef::Id("F1".into()), "deploy")
            .expect("put");

        manager.clear();
        assert!(!manager.cache_dir().exists());
    }

    #[test]
    fn git_url_detection() {
        assert!(is_git_url("git://host/repo"));
        assert!(is_git_url("git+http://host/repo"));
        assert!(is_git_url("git+https://host/repo"));
        assert!(is_git_url("https://host/project.git"));
        assert!(!is_git_url("https://host/project"));
    }

    #[test]
    fn svn_url_detection() {
        assert!(is_svn_url("https://host/svn/repo"));
        assert!(is_svn_url("http://host/svn/repo"));
        assert!(is_svn_url("svn://host/repo"));
        assert!(!is_svn_url("httpp://host/svn/repo"));
        assert!(!is_svn_url("svn:path"));
        assert!(!is_svn_url("https://host/repo"));
    }

    #[test]
    fn downloadable_fetches_over_http() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind server");
        let addr = server.server_addr().to_ip().expect("ip addr");
        let handle = std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(tiny_http::Response::from_string("artifact payload"));
            }
        });

        let storage = tempdir().expect("tempdir");
        let plan = plan_with_files(&format!(
            r#"{{"F1": {{"Type": "Downloadable", "URL": "http://{addr}/artifact.txt", "Name": "artifact.txt"}}}}"#
        ));
        let mut manager = FilesManager::new(storage.path(), &plan).expect("manager");

        let link = manager
            .put_file(&FileRef::Id("F1".into()), "deploy")
            .expect("put");
        handle.join().expect("server thread");

        // The symlink points at the artifact folder; the payload is inside.
        let payload = std::fs::read_to_string(link.join("artifact.txt")).expect("read");
        assert_eq!(payload, "artifact payload");
    }

    #[test]
    fn downloadable_with_bad_url_fails() {
        let storage = tempdir().expect("tempdir");
        let plan = plan_with_files(
            r#"{"F1": {"Type": "Downloadable", "URL": "not a url", "Name": "a"}}"#,
        );
        let mut manager = FilesManager::new(storage.path(), &plan).expect("manager");
        assert!(manager.put_file(&FileRef::Id("F1".into()), "deploy").is_err());
    }

    #[test]
    fn downloadable_folder_is_reused() {
        let storage = tempdir().expect("tempdir");
        let plan = plan_with_files(
            r#"{"F1": {"Type": "Downloadable", "URL": "http://127.0.0.1:1/x", "Name": "x"}}"#,
        );
        let mut manager = FilesManager::new(storage.path(), &plan).expect("manager");

        // Pre-populate the folder: the fetch must be skipped entirely.
        std::fs::create_dir_all(manager.cache_dir().join("F1")).expect("mkdir");
        let link = manager
            .put_file(&FileRef::Id("F1".into()), "deploy")
            .expect("put");
        assert!(link.ends_with("deploy/x"));
    }
}
