use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrustBundleError {
    #[error("RDS CA bundle not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read RDS CA bundle from {}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("RDS CA bundle at {} is not valid PEM", .path.display())]
    Malformed { path: PathBuf, source: io::Error },

    #[error("RDS CA bundle at {} contains no certificates", .0.display())]
    Empty(PathBuf),

    #[error(
        "no RDS CA bundle found; set RDS_CA_BUNDLE_PATH or install one at {}",
        .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" or ")
    )]
    NoDefault(Vec<PathBuf>),
}

/// File name searched for when no bundle path is configured.
pub const DEFAULT_CA_BUNDLE_FILE: &str = "certs/rds-ca-bundle.pem";

/// Certificate authority material for verifying the database's TLS identity.
///
/// Loaded once at startup; there is no fallback to an unverified connection.
#[derive(Clone, Debug)]
pub struct TrustBundle {
    path: PathBuf,
    pem: Vec<u8>,
    certificates: usize,
}

impl TrustBundle {
    /// Load the configured bundle, or search the default locations when none
    /// is configured.
    pub fn resolve(configured: Option<&Path>) -> Result<Self, TrustBundleError> {
        match configured {
            Some(path) => Self::load(path),
            None => Self::load_first(&Self::default_locations()),
        }
    }

    /// `certs/rds-ca-bundle.pem` beside the executable, then under the
    /// working directory.
    pub fn default_locations() -> Vec<PathBuf> {
        let mut locations = Vec::new();
        if let Some(dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
            locations.push(dir.join(DEFAULT_CA_BUNDLE_FILE));
        }
        locations.push(PathBuf::from(DEFAULT_CA_BUNDLE_FILE));
        locations
    }

    fn load_first(candidates: &[PathBuf]) -> Result<Self, TrustBundleError> {
        for path in candidates {
            match Self::load(path) {
                Err(TrustBundleError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(TrustBundleError::NoDefault(candidates.to_vec()))
    }

    pub fn load(path: &Path) -> Result<Self, TrustBundleError> {
        let pem = std::fs::read(path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => TrustBundleError::NotFound(path.to_path_buf()),
            _ => TrustBundleError::Read {
                path: path.to_path_buf(),
                source,
            },
        })?;
        Self::from_pem(path, pem)
    }

    pub fn from_pem(path: &Path, pem: Vec<u8>) -> Result<Self, TrustBundleError> {
        let certificates = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TrustBundleError::Malformed {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        if certificates == 0 {
            return Err(TrustBundleError::Empty(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            pem,
            certificates,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pem(&self) -> &[u8] {
        &self.pem
    }

    pub fn certificate_count(&self) -> usize {
        self.certificates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FAKE_CERT: &str = "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIUY2VydA==\n-----END CERTIFICATE-----\n";

    #[test]
    fn loads_bundle_with_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}{}", FAKE_CERT, FAKE_CERT).unwrap();

        let bundle = TrustBundle::load(file.path()).unwrap();
        assert_eq!(bundle.certificate_count(), 2);
        assert_eq!(bundle.path(), file.path());
        assert!(bundle.pem().starts_with(b"-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.pem");
        assert!(matches!(
            TrustBundle::load(&path),
            Err(TrustBundleError::NotFound(p)) if p == path
        ));
    }

    #[test]
    fn first_existing_default_location_wins() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("beside-exe").join(DEFAULT_CA_BUNDLE_FILE);
        let present = dir.path().join(DEFAULT_CA_BUNDLE_FILE);
        std::fs::create_dir_all(present.parent().unwrap()).unwrap();
        std::fs::write(&present, FAKE_CERT).unwrap();

        let bundle = TrustBundle::load_first(&[missing, present.clone()]).unwrap();
        assert_eq!(bundle.path(), present);
        assert_eq!(bundle.certificate_count(), 1);
    }

    #[test]
    fn no_default_location_lists_every_path_searched() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = vec![dir.path().join("a.pem"), dir.path().join("b.pem")];

        let err = TrustBundle::load_first(&candidates).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("RDS_CA_BUNDLE_PATH"), "{}", message);
        assert!(message.contains(&candidates[0].display().to_string()));
        assert!(message.contains(&candidates[1].display().to_string()));
    }

    #[test]
    fn default_locations_start_beside_the_executable() {
        let locations = TrustBundle::default_locations();
        let exe_dir = std::env::current_exe().unwrap().parent().unwrap().to_path_buf();
        assert_eq!(locations.first(), Some(&exe_dir.join(DEFAULT_CA_BUNDLE_FILE)));
        assert_eq!(locations.last(), Some(&PathBuf::from(DEFAULT_CA_BUNDLE_FILE)));
    }

    #[test]
    fn configured_path_is_not_searched_past() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configured.pem");
        assert!(matches!(
            TrustBundle::resolve(Some(&path)),
            Err(TrustBundleError::NotFound(p)) if p == path
        ));
    }

    #[test]
    fn file_without_certificates_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not a certificate bundle").unwrap();
        assert!(matches!(
            TrustBundle::load(file.path()),
            Err(TrustBundleError::Empty(_))
        ));
    }
}
