use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::ResultExt;
use tokio::{fs, io::AsyncWriteExt};

use super::{BlockStore, IoSnafu, StoreError};

/// Filesystem-backed store.
///
/// Writes go to a dot-prefixed temp file which is flushed fully to disk and
/// then renamed into place. Rename is atomic on POSIX filesystems, so a
/// crash mid-write leaves either the previous state or a stray temp file
/// that enumeration ignores, never a torn artifact.
#[derive(Debug)]
pub struct FsBlockStore {
    dir: PathBuf,
    extension: String,
}

impl FsBlockStore {
    pub async fn open(dir: &Path, extension: &str) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).await.context(IoSnafu {
            path: dir.display().to_string(),
        })?;
        Ok(FsBlockStore {
            dir: dir.to_owned(),
            extension: extension.to_owned(),
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{}", self.extension))
    }

    fn temp_path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!(".{name}.{}.tmp", self.extension))
    }
}

#[async_trait]
impl BlockStore for FsBlockStore {
    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<(), StoreError> {
        let temp_path = self.temp_path_for(name);
        let final_path = self.path_for(name);

        let mut file = fs::File::create(&temp_path).await.context(IoSnafu {
            path: temp_path.display().to_string(),
        })?;
        file.write_all(&data).await.context(IoSnafu {
            path: temp_path.display().to_string(),
        })?;
        file.sync_all().await.context(IoSnafu {
            path: temp_path.display().to_string(),
        })?;
        drop(file);

        fs::rename(&temp_path, &final_path).await.context(IoSnafu {
            path: final_path.display().to_string(),
        })
    }

    async fn read(&self, name: &str) -> Result<Bytes, StoreError> {
        let path = self.path_for(name);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound {
                    store: self.location(),
                    name: name.to_owned(),
                })
            }
            Err(error) => Err(error).context(IoSnafu {
                path: path.display().to_string(),
            }),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_for(name);
        fs::try_exists(&path).await.context(IoSnafu {
            path: path.display().to_string(),
        })
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_for(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error).context(IoSnafu {
                path: path.display().to_string(),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let pattern = self
            .dir
            .join(format!("*.{}", self.extension))
            .to_string_lossy()
            .into_owned();
        let suffix = format!(".{}", self.extension);

        let names = tokio::task::spawn_blocking(move || {
            let mut names = Vec::new();
            for path in glob::glob(&pattern).expect("store glob pattern is valid").flatten() {
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if file_name.starts_with('.') {
                    continue;
                }
                if let Some(name) = file_name.strip_suffix(&suffix) {
                    names.push(name.to_owned());
                }
            }
            names
        })
        .await
        .map_err(|error| StoreError::Background {
            reason: error.to_string(),
        })?;

        let mut names = names;
        names.sort_unstable();
        Ok(names)
    }
}
