use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncRead;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constraints::Constraints;
use crate::error::{Result, SandboxError};
use crate::pool::BoxPool;
use crate::process::BoxProcess;
use crate::BoxId;

/// One leased `isolate` box. Obtained from [`BoxPool::allocate`]; hand it back with
/// [`IsolateBox::close`]. A box dropped without `close` is released in the background.
#[derive(Debug)]
pub struct IsolateBox {
    id: BoxId,
    root: PathBuf,
    pool: BoxPool,
    released: bool,
}

impl IsolateBox {
    pub(crate) fn new(pool: BoxPool, id: BoxId, root: PathBuf) -> Self {
        Self {
            id,
            root,
            pool,
            released: false,
        }
    }

    pub fn id(&self) -> BoxId {
        self.id
    }

    /// Root directory reported by `isolate --init`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory mounted as `/box`, the working directory of every run.
    pub fn work_dir(&self) -> PathBuf {
        self.root.join("box")
    }

    /// Writes `content` to `relative` inside the work directory, creating parent
    /// directories and truncating an existing file.
    pub async fn add_file(
        &self,
        relative: impl AsRef<Path>,
        content: impl AsRef<[u8]>,
    ) -> Result<PathBuf> {
        let relative = relative.as_ref();
        resolve_in(&self.work_dir(), relative)?;
        let outside = || SandboxError::PathOutsideBox(relative.to_path_buf());

        // Walk down from the work dir one name at a time; a symlink anywhere on the
        // way is refused before anything is created beneath it.
        let mut target = fs::canonicalize(self.work_dir()).await?;
        let mut names = relative.components().filter_map(|component| match component {
            Component::Normal(name) => Some(name),
            _ => None,
        });
        let file_name = names.next_back().ok_or_else(|| outside())?;
        for name in names {
            target.push(name);
            match fs::symlink_metadata(&target).await {
                Ok(meta) if meta.file_type().is_symlink() => return Err(outside()),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&target).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        target.push(file_name);
        if let Ok(meta) = fs::symlink_metadata(&target).await
            && meta.file_type().is_symlink()
        {
            return Err(outside());
        }
        fs::write(&target, content).await?;
        debug!(box_id = self.id, path = %target.display(), "added file to box");
        Ok(target)
    }

    /// Starts `argv` under `isolate --run` without waiting for it. `stdin` is copied
    /// into the process by a background task. `None` applies [`Constraints::default`].
    pub fn run<R>(
        &self,
        argv: &[String],
        stdin: R,
        constraints: Option<&Constraints>,
    ) -> Result<BoxProcess>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let constraints = constraints.copied().unwrap_or_default();
        let meta_path = self
            .pool
            .config()
            .meta_dir
            .join(format!("isorun-{}-{}.meta", self.id, Uuid::new_v4()));
        let command = self
            .pool
            .launcher()
            .run_command(self.id, &meta_path, &constraints, argv);
        debug!(box_id = self.id, cmd = ?argv, "starting command");
        BoxProcess::spawn(command, stdin, meta_path, self.id)
    }

    /// Returns the box to its pool.
    pub async fn close(mut self) -> Result<()> {
        self.released = true;
        self.pool.release(self.id).await
    }
}

impl Drop for IsolateBox {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(box_id = self.id, "box dropped without close; releasing");
        let pool = self.pool.clone();
        let box_id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = pool.release(box_id).await {
                    warn!(box_id, error = %err, "failed to release dropped box");
                }
            });
        }
    }
}

/// Joins `relative` onto `base`, rejecting anything that could leave `base`.
fn resolve_in(base: &Path, relative: &Path) -> Result<PathBuf> {
    let mut has_name = false;
    for component in relative.components() {
        match component {
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::PathOutsideBox(relative.to_path_buf()));
            }
        }
    }
    if !has_name {
        return Err(SandboxError::PathOutsideBox(relative.to_path_buf()));
    }
    Ok(base.join(relative))
}
