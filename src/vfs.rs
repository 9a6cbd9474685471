//! The versioned VFS entry point.
//!
//! Peers attached to the same database share one `VersionedVfs` by cloning
//! it: the advisory lock registry and the per-path broadcast channels live
//! behind the shared inner state, so every clone coordinates with the others.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sql_vfs::error::Error as VfsError;
use sql_vfs::{MethodMask, OpenAccess, OpenKind, OpenOptions, Vfs};

use crate::error::Error;
use crate::handle::DbHandle;
use crate::index::AuxIndex;
use crate::locks::LockRegistry;
use crate::peers::ChannelRegistry;
use crate::simple::{map_open_error, transient_name, SimpleFile};
use crate::store::VersionedStore;

struct Inner {
    registry: Arc<LockRegistry>,
    channels: ChannelRegistry,
}

#[derive(Clone)]
pub struct VersionedVfs {
    inner: Arc<Inner>,
}

impl VersionedVfs {
    pub fn new() -> Self {
        VersionedVfs {
            inner: Arc::new(Inner {
                registry: LockRegistry::new(),
                channels: ChannelRegistry::default(),
            }),
        }
    }

    /// The advisory lock service shared by every peer of this VFS.
    pub fn lock_registry(&self) -> Arc<LockRegistry> {
        self.inner.registry.clone()
    }
}

impl Default for VersionedVfs {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `path?key=value&…` into the path and its recognized parameters.
fn split_params(db: &str) -> (&str, Vec<(&str, &str)>) {
    match db.split_once('?') {
        None => (db, Vec::new()),
        Some((path, query)) => (
            path,
            query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
                .collect(),
        ),
    }
}

fn param_enabled(params: &[(&str, &str)], key: &str) -> bool {
    params
        .iter()
        .any(|(name, value)| *name == key && *value != "0")
}

impl Vfs for VersionedVfs {
    type Handle = DbHandle;
    type Error = Error;

    async fn open(&self, db: &str, opts: OpenOptions) -> Result<DbHandle, VfsError<Error>> {
        let (path, params) = split_params(db);
        let immutable = param_enabled(&params, "immutable");
        let nolock = param_enabled(&params, "nolock");

        if opts.kind == OpenKind::MainDb && !immutable && !nolock {
            let create = matches!(opts.access, OpenAccess::Create | OpenAccess::CreateNew);
            let store = VersionedStore::open(
                path,
                self.inner.registry.clone(),
                &self.inner.channels,
                create,
            )
            .await
            .map_err(|err| map_open_error(err, db))?;
            Ok(DbHandle::Versioned(Box::new(store)))
        } else {
            let file = SimpleFile::open(
                path,
                &opts,
                immutable,
                nolock || immutable,
                &self.inner.registry,
            )
            .map_err(|err| map_open_error(err, db))?;
            Ok(DbHandle::Plain(file))
        }
    }

    async fn delete(&self, db: &str) -> Result<(), VfsError<Error>> {
        let (path, _) = split_params(db);
        match std::fs::remove_file(path) {
            Ok(()) => {
                // The auxiliary index travels with its database.
                AuxIndex::for_db(path).delete()?;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(VfsError::NotFound {
                    name: path.to_string(),
                })
            }
            Err(err) => Err(Error::Remove {
                path: path.into(),
                source: err,
            }
            .into()),
        }
    }

    async fn exists(&self, db: &str) -> Result<bool, VfsError<Error>> {
        let (path, _) = split_params(db);
        Ok(Path::new(path).exists())
    }

    async fn temporary_name(&self) -> String {
        transient_name()
    }

    fn random(&self, buffer: &mut [u8]) {
        rand::thread_rng().fill(buffer);
    }

    async fn sleep(&self, duration: Duration) -> Duration {
        tokio::time::sleep(duration).await;
        duration
    }

    fn async_methods(&self) -> MethodMask {
        MethodMask::ALL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_params_variants() {
        assert_eq!(split_params("/a/db"), ("/a/db", vec![]));
        assert_eq!(
            split_params("/a/db?immutable=1"),
            ("/a/db", vec![("immutable", "1")])
        );
        assert_eq!(
            split_params("/a/db?nolock=1&immutable=0"),
            ("/a/db", vec![("nolock", "1"), ("immutable", "0")])
        );
        assert_eq!(split_params("/a/db?nolock"), ("/a/db", vec![("nolock", "")]));
    }

    #[test]
    fn params_with_zero_value_are_disabled() {
        let (_, params) = split_params("/a/db?immutable=0&nolock=1");
        assert!(!param_enabled(&params, "immutable"));
        assert!(param_enabled(&params, "nolock"));
        assert!(param_enabled(&[("immutable", "")], "immutable"));
    }
}
