//! Fixture payload suppliers.
//!
//! The server core never touches the filesystem itself; it asks a
//! [`FixtureSource`] for the payload bytes behind a fixture name. The stock
//! implementation, [`DirSource`], reads `<root>/<name>.json` — the layout
//! test suites typically keep their canned payloads in.

use std::fs;
use std::io;
use std::path::PathBuf;

/// Supplies response payloads by fixture name.
///
/// Implementations must be cheap to call at mock-registration time and
/// thread-safe — registration can happen from any test thread.
pub trait FixtureSource: Send + Sync + 'static {
    /// Loads the full text payload for the fixture called `name`.
    ///
    /// # Errors
    ///
    /// Any [`io::Error`] from the underlying storage; the registration API
    /// treats a failed load as a programmer error and panics.
    fn load(&self, name: &str) -> io::Result<String>;
}

/// A [`FixtureSource`] backed by a directory of `.json` files.
///
/// `load("scores")` reads `<root>/scores.json`.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    /// Creates a source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FixtureSource for DirSource {
    fn load(&self, name: &str) -> io::Result<String> {
        fs::read_to_string(self.root.join(format!("{name}.json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_json_file_from_root() {
        let dir = std::env::temp_dir().join(format!("canned-fixtures-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("scores.json"), r#"{"home":2,"away":1}"#).unwrap();

        let source = DirSource::new(&dir);
        assert_eq!(source.load("scores").unwrap(), r#"{"home":2,"away":1}"#);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_fixture_is_an_error() {
        let source = DirSource::new(std::env::temp_dir());
        assert!(source.load("definitely-not-here").is_err());
    }
}
