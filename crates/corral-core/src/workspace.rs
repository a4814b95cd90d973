//! Per-environment workspace directory: file operations confined by the
//! path guard, script runs, requirement installs and git clones.

use crate::registry::{ManagedEnvironment, ResourceRegistry};
use crate::{pathguard, CoreError, Handle};
use corral_runtime::RuntimeError;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInfo {
    pub env_id: Handle,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloneInfo {
    pub repo_url: String,
    pub clone_path: PathBuf,
    pub dir_name: String,
}

impl ResourceRegistry {
    /// Create `<root>/workspace`; returns the existing one if already created.
    pub fn workspace_create(&self, handle: &str) -> Result<WorkspaceInfo, CoreError> {
        let env = self.environment(handle)?;
        let mut slot = env.workspace_slot().write();
        if let Some(path) = slot.as_ref() {
            return Ok(WorkspaceInfo {
                env_id: env.handle().clone(),
                path: path.clone(),
            });
        }
        let dir = env.root().join("workspace");
        fs::create_dir_all(&dir)?;
        *slot = Some(dir.clone());
        debug!("workspace ready at {}", dir.display());
        Ok(WorkspaceInfo {
            env_id: env.handle().clone(),
            path: dir,
        })
    }

    fn require_workspace(
        &self,
        handle: &str,
    ) -> Result<(Arc<ManagedEnvironment>, PathBuf), CoreError> {
        let env = self.environment(handle)?;
        let Some(dir) = env.workspace() else {
            return Err(CoreError::InvalidArgument(format!(
                "no workspace created for environment {handle}"
            )));
        };
        Ok((env, dir))
    }

    /// Write `content`, creating parent directories as needed.
    pub fn workspace_write_file(
        &self,
        handle: &str,
        rel: &str,
        content: &str,
    ) -> Result<FileEntry, CoreError> {
        let (_, dir) = self.require_workspace(handle)?;
        let path = file_path(&dir, rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(FileEntry {
            name: entry_name(&path),
            path: rel.to_owned(),
            is_dir: false,
            size: fs::metadata(&path)?.len(),
        })
    }

    pub fn workspace_read_file(&self, handle: &str, rel: &str) -> Result<String, CoreError> {
        let (_, dir) = self.require_workspace(handle)?;
        let path = pathguard::resolve(&dir, rel)?;
        if !path.is_file() {
            return Err(CoreError::not_found("file", rel));
        }
        Ok(fs::read_to_string(&path)?)
    }

    /// Entries of the workspace, or of `sub` inside it, sorted by name.
    pub fn workspace_list_files(
        &self,
        handle: &str,
        sub: Option<&str>,
    ) -> Result<Vec<FileEntry>, CoreError> {
        let (_, dir) = self.require_workspace(handle)?;
        let sub = sub.filter(|s| !s.is_empty());
        let target = match sub {
            Some(s) => pathguard::resolve(&dir, s)?,
            None => dir,
        };
        if !target.is_dir() {
            return Err(CoreError::not_found("directory", sub.unwrap_or(".")));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&target)?.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = match sub {
                Some(s) => format!("{}/{name}", s.trim_end_matches(['/', '\\'])),
                None => name.clone(),
            };
            entries.push(FileEntry {
                name,
                path,
                is_dir: meta.is_dir(),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Delete a file or an empty directory.
    pub fn workspace_delete_file(&self, handle: &str, rel: &str) -> Result<(), CoreError> {
        let (_, dir) = self.require_workspace(handle)?;
        let path = file_path(&dir, rel)?;
        if path.is_dir() {
            fs::remove_dir(&path)?;
        } else if path.exists() {
            fs::remove_file(&path)?;
        } else {
            return Err(CoreError::not_found("file", rel));
        }
        Ok(())
    }

    pub fn workspace_run_script(
        &self,
        handle: &str,
        rel: &str,
        args: &[String],
    ) -> Result<String, CoreError> {
        let (env, dir) = self.require_workspace(handle)?;
        let path = pathguard::resolve(&dir, rel)?;
        if !path.is_file() {
            return Err(CoreError::not_found("script", rel));
        }
        Ok(self.runtime().run_file(env.runtime_env(), &path, args)?)
    }

    /// Install from a requirements file inside the workspace.
    pub fn install_requirements(
        &self,
        handle: &str,
        rel: &str,
        upgrade: bool,
    ) -> Result<(), CoreError> {
        let (env, dir) = self.require_workspace(handle)?;
        let path = pathguard::resolve(&dir, rel)?;
        if !path.is_file() {
            return Err(CoreError::not_found("requirements file", rel));
        }
        self.runtime()
            .install_requirements(env.runtime_env(), &path, upgrade)?;
        info!("installed requirements {rel} into {handle}");
        Ok(())
    }

    /// `git clone` into the workspace. The directory name defaults to the
    /// repository name from the URL and must not exist yet.
    pub fn workspace_git_clone(
        &self,
        handle: &str,
        repo_url: &str,
        dir_name: Option<&str>,
    ) -> Result<CloneInfo, CoreError> {
        if repo_url.is_empty() || repo_url.starts_with('-') {
            return Err(CoreError::InvalidArgument(format!(
                "invalid repository URL: {repo_url:?}"
            )));
        }
        let (_, dir) = self.require_workspace(handle)?;
        let dir_name = dir_name
            .filter(|d| !d.is_empty())
            .map_or_else(|| repo_name(repo_url), str::to_owned);
        let target = file_path(&dir, &dir_name)?;
        if target.exists() {
            return Err(CoreError::AlreadyExists(dir_name));
        }

        let output = Command::new("git")
            .arg("clone")
            .arg("--")
            .arg(repo_url)
            .arg(&target)
            .current_dir(&dir)
            .output()?;
        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(CoreError::Runtime(RuntimeError::ExecFailed {
                message: format!("git clone exited with {}", output.status),
                output: text,
            }));
        }

        info!("cloned {repo_url} into {}", target.display());
        Ok(CloneInfo {
            repo_url: repo_url.to_owned(),
            clone_path: target,
            dir_name,
        })
    }

    pub fn workspace_destroy(&self, handle: &str) -> Result<(), CoreError> {
        let env = self.environment(handle)?;
        let mut slot = env.workspace_slot().write();
        let Some(dir) = slot.as_ref() else {
            return Err(CoreError::InvalidArgument(format!(
                "no workspace to destroy for environment {handle}"
            )));
        };
        match fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *slot = None;
        Ok(())
    }
}

/// Resolve a path that must name something strictly inside `dir`.
fn file_path(dir: &Path, rel: &str) -> Result<PathBuf, CoreError> {
    let path = pathguard::resolve(dir, rel)?;
    if path == dir {
        return Err(CoreError::InvalidArgument(format!(
            "{rel:?} does not name a file"
        )));
    }
    Ok(path)
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Last path component of a git URL without `.git`, e.g.
/// `git@host:user/tool.git` gives `tool`.
pub(crate) fn repo_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let name = trimmed.rsplit(['/', ':']).next().unwrap_or_default();
    if name.is_empty() {
        "repo".to_owned()
    } else {
        name.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StorageLayout;
    use corral_runtime::MockRuntime;

    fn setup() -> (tempfile::TempDir, ResourceRegistry, String) {
        let dir = tempfile::tempdir().unwrap();
        let reg =
            ResourceRegistry::new(StorageLayout::new(dir.path()), Arc::new(MockRuntime::new()))
                .unwrap();
        let env = reg.create_environment("ws", None).unwrap();
        (dir, reg, env.env_id.to_string())
    }

    #[test]
    fn repo_name_forms() {
        assert_eq!(repo_name("https://github.com/user/repo.git"), "repo");
        assert_eq!(repo_name("https://github.com/user/repo"), "repo");
        assert_eq!(repo_name("git@github.com:user/tool.git"), "tool");
        assert_eq!(repo_name("https://example.com/x/"), "x");
        assert_eq!(repo_name(".git"), "repo");
    }

    #[test]
    fn workspace_create_is_idempotent() {
        let (_dir, reg, id) = setup();
        let first = reg.workspace_create(&id).unwrap();
        let second = reg.workspace_create(&id).unwrap();
        assert_eq!(first.path, second.path);
        assert!(first.path.ends_with("workspace"));
        assert!(first.path.is_dir());
    }

    #[test]
    fn operations_require_workspace() {
        let (_dir, reg, id) = setup();
        assert!(matches!(
            reg.workspace_write_file(&id, "a.txt", "x"),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            reg.workspace_destroy(&id),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn write_read_list_delete() {
        let (_dir, reg, id) = setup();
        reg.workspace_create(&id).unwrap();

        let entry = reg
            .workspace_write_file(&id, "pkg/mod/main.py", "print('hi')\n")
            .unwrap();
        assert_eq!(entry.name, "main.py");
        assert_eq!(entry.size, 12);
        assert_eq!(
            reg.workspace_read_file(&id, "pkg/mod/main.py").unwrap(),
            "print('hi')\n"
        );

        let top = reg.workspace_list_files(&id, None).unwrap();
        assert_eq!(top.len(), 1);
        assert!(top[0].is_dir);
        let inner = reg.workspace_list_files(&id, Some("pkg/mod")).unwrap();
        assert_eq!(inner[0].path, "pkg/mod/main.py");

        reg.workspace_delete_file(&id, "pkg/mod/main.py").unwrap();
        assert!(reg.workspace_list_files(&id, Some("pkg/mod")).unwrap().is_empty());
        assert!(matches!(
            reg.workspace_delete_file(&id, "pkg/mod/main.py"),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn traversal_is_refused_everywhere() {
        let (_dir, reg, id) = setup();
        reg.workspace_create(&id).unwrap();
        assert!(matches!(
            reg.workspace_write_file(&id, "../escape.txt", "x"),
            Err(CoreError::PathTraversal(_))
        ));
        assert!(matches!(
            reg.workspace_read_file(&id, "/etc/passwd"),
            Err(CoreError::PathTraversal(_))
        ));
        assert!(matches!(
            reg.workspace_list_files(&id, Some("..")),
            Err(CoreError::PathTraversal(_))
        ));
        assert!(reg.workspace_delete_file(&id, ".").is_err());
    }

    #[test]
    fn run_script_in_workspace() {
        let (_dir, reg, id) = setup();
        reg.workspace_create(&id).unwrap();
        reg.workspace_write_file(&id, "run.sh", "echo ran \"$1\"\n").unwrap();
        let out = reg
            .workspace_run_script(&id, "run.sh", &["ok".to_owned()])
            .unwrap();
        assert_eq!(out.trim(), "ran ok");
        assert!(matches!(
            reg.workspace_run_script(&id, "missing.sh", &[]),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn requirements_install_through_runtime() {
        let (_dir, reg, id) = setup();
        reg.workspace_create(&id).unwrap();
        reg.workspace_write_file(&id, "requirements.txt", "numpy==1.26.4\n# c\nrich\n")
            .unwrap();
        reg.install_requirements(&id, "requirements.txt", false).unwrap();
        let names: Vec<String> = reg
            .list_packages(&id)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["numpy", "rich"]);
    }

    #[test]
    fn clone_into_existing_dir_is_refused() {
        let (_dir, reg, id) = setup();
        reg.workspace_create(&id).unwrap();
        reg.workspace_write_file(&id, "repo/README", "x").unwrap();
        assert!(matches!(
            reg.workspace_git_clone(&id, "https://example.invalid/user/repo.git", None),
            Err(CoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            reg.workspace_git_clone(&id, "--upload-pack=evil", None),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn destroy_workspace_clears_it() {
        let (_dir, reg, id) = setup();
        let ws = reg.workspace_create(&id).unwrap();
        reg.workspace_write_file(&id, "f.txt", "x").unwrap();
        reg.workspace_destroy(&id).unwrap();
        assert!(!ws.path.exists());
        assert!(reg.environment(&id).unwrap().workspace().is_none());
    }
}
