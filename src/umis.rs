use std::path::{Path, PathBuf};

use ahash::AHashSet;
use log::warn;
use thiserror::Error;

/// Whitelist of known UMI sequences. Read once before processing and never modified.
#[derive(Clone, Debug, Default)]
pub struct KnownUmis(AHashSet<String>);

impl<'a> FromIterator<&'a str> for KnownUmis {
    /// Surrounding whitespace is stripped and blank lines are ignored.
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        KnownUmis(
            iter.into_iter()
                .map(str::trim)
                .filter(|umi| !umi.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }
}

impl KnownUmis {
    /// Load a UMI list with one UMI per line.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<KnownUmis, UmiListError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| UmiListError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let umis: KnownUmis = content.lines().collect();
        if umis.is_empty() {
            warn!("UMI list {} is empty, every record will be rejected", path.display());
        }
        let unmatchable = umis.unmatchable().count();
        if unmatchable > 0 {
            warn!(
                "{} entries in {} are not uppercase sequences and can never match a read",
                unmatchable,
                path.display()
            );
        }

        Ok(umis)
    }

    pub fn contains(&self, umi: &str) -> bool {
        self.0.contains(umi)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // Read UMIs are extracted as a run of uppercase letters, anything else is dead weight
    fn unmatchable(&self) -> impl Iterator<Item = &str> + '_ {
        self.0
            .iter()
            .map(String::as_str)
            .filter(|umi| !umi.bytes().all(|b| b.is_ascii_uppercase()))
    }
}

#[derive(Debug, Error)]
pub enum UmiListError {
    #[error("Unable to read UMI list {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
