use apiary_core::{KernelError, Result};
use std::path::{Path, PathBuf};

/// All well-known paths under `.apiary/`.
#[derive(Debug, Clone)]
pub struct ApiaryPaths {
    pub root: PathBuf,
    pub apiary_dir: PathBuf,
    pub config_yaml: PathBuf,
    pub ledger_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub project_segment: PathBuf,
}

impl ApiaryPaths {
    /// Derive all paths from a workspace root. Pure computation, no I/O.
    pub fn discover(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let apiary_dir = root.join(".apiary");
        let ledger_dir = apiary_dir.join("ledger");
        Self {
            config_yaml: apiary_dir.join("governance.yaml"),
            runs_dir: ledger_dir.join("runs"),
            project_segment: ledger_dir.join("project.jsonl"),
            ledger_dir,
            apiary_dir,
            root,
        }
    }

    /// Create all required directories. Idempotent.
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(&self.runs_dir)?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.ledger_dir.is_dir()
    }

    /// Segment file for a scope: the project segment for `None`, the Run's
    /// own file otherwise.
    pub fn segment_file(&self, scope: Option<&str>) -> Result<PathBuf> {
        match scope {
            None => Ok(self.project_segment.clone()),
            Some(run_id) => {
                validate_scope_id(run_id)?;
                Ok(self.runs_dir.join(format!("{run_id}.jsonl")))
            }
        }
    }

    /// Walk up from `start` looking for a directory containing `.apiary/`.
    pub fn find_root(start: &Path) -> Option<PathBuf> {
        let mut cur = start.to_path_buf();
        loop {
            if cur.join(".apiary").is_dir() {
                return Some(cur);
            }
            if !cur.pop() {
                return None;
            }
        }
    }
}

/// Sidecar file next to a segment: `<segment>.tip`, `<segment>.lock`.
pub fn sidecar(segment: &Path, ext: &str) -> PathBuf {
    let mut name = segment.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Human-readable segment name used in errors and logs.
pub fn segment_name(scope: Option<&str>) -> String {
    match scope {
        None => "project".to_string(),
        Some(run_id) => format!("runs/{run_id}"),
    }
}

/// Run ids become file names, so they are restricted to a safe alphabet.
pub fn validate_scope_id(run_id: &str) -> Result<()> {
    let ok = !run_id.is_empty()
        && run_id.len() <= 128
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(KernelError::validation(format!(
            "invalid run id `{run_id}`: use ASCII letters, digits, `_`, `-` or `.`"
        )))
    }
}
