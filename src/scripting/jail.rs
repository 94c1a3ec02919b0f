/// `scripting/jail.rs` - directory jails for sandboxed file access
///
/// A requested path is anchored at the jail root (or at the user's home
/// directory when it starts with `~/`), normalised lexically, hardened
/// against symlinks on the part that exists, and accepted only when the jail
/// root is one of its ancestors.
use std::path::{Component, Path, PathBuf};

use crate::error::{ScriptError, ScriptResult};

/// Prefix that anchors a path at the user's home directory instead of the jail root.
pub const HOME_PREFIX: &str = "~";

#[derive(Debug, Clone, PartialEq)]
pub struct Jail {
    root: PathBuf,
}

impl Jail {
    /// Creates a jail rooted at `root`. Relative roots are taken from the
    /// current directory; existing roots are canonicalised.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = absolutize(root.as_ref());
        let root = std::fs::canonicalize(&root).unwrap_or_else(|_| normalize(&root));
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `requested` to an absolute path inside this jail.
    ///
    /// # Errors
    ///
    /// Returns `ScriptError::PolicyViolation` when the path lands outside the
    /// root, including via `..` or a symlinked directory.
    pub fn resolve(&self, requested: &str) -> ScriptResult<PathBuf> {
        if requested.is_empty() {
            return Err(ScriptError::PolicyViolation("empty path".into()));
        }
        let anchored = self.anchor(requested)?;
        let resolved = harden(&normalize(&anchored));
        if self.contains(&resolved) {
            Ok(resolved)
        } else {
            Err(ScriptError::PolicyViolation(format!(
                "'{requested}' resolves outside {}",
                self.root.display()
            )))
        }
    }

    /// True when the jail root is `path` itself or one of its ancestors.
    pub fn contains(&self, path: &Path) -> bool {
        path.ancestors().any(|ancestor| ancestor == self.root)
    }

    fn anchor(&self, requested: &str) -> ScriptResult<PathBuf> {
        anchor_at(&self.root, requested)
    }
}

/// A set of jails; a path is accepted if any member accepts it.
#[derive(Debug, Clone, Default)]
pub struct JailSet {
    jails: Vec<Jail>,
}

impl JailSet {
    pub fn new(jails: Vec<Jail>) -> Self {
        Self { jails }
    }

    /// Adds a root unless an identical one is already present.
    pub fn insert(&mut self, jail: Jail) {
        if !self.jails.contains(&jail) {
            self.jails.push(jail);
        }
    }

    pub fn len(&self) -> usize {
        self.jails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jails.is_empty()
    }

    /// Resolves against each root in insertion order and returns the first hit.
    pub fn resolve(&self, requested: &str) -> ScriptResult<PathBuf> {
        let mut last_err = None;
        for jail in &self.jails {
            match jail.resolve(requested) {
                Ok(path) => return Ok(path),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ScriptError::PolicyViolation(format!("no jail root configured for '{requested}'"))
        }))
    }
}

/// Anchors `requested` at `base`, at home for a leading `~`, or keeps it when absolute.
pub fn anchor_at(base: &Path, requested: &str) -> ScriptResult<PathBuf> {
    let path = Path::new(requested);
    let mut components = path.components();
    if let Some(Component::Normal(first)) = components.next() {
        if first == HOME_PREFIX {
            let home = dirs::home_dir().ok_or_else(|| {
                ScriptError::PolicyViolation("home directory is not available".into())
            })?;
            return Ok(home.join(components.as_path()));
        }
    }
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(base.join(path))
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Lexical normalisation: drops `.`, folds `..` into its parent, never
/// climbs above the filesystem root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(p) => out.push(p),
        }
    }
    out
}

/// Canonicalises the deepest existing ancestor so a symlinked directory
/// inside the jail cannot point the rest of the path elsewhere.
fn harden(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        if let Ok(real) = std::fs::canonicalize(existing) {
            let mut out = real;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}
