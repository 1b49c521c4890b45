//! Where the libraries to inject live on the device.

use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::abi::{Abi, UnknownAbi};

pub const DEFAULT_INTERCEPTOR_LIBRARY: &str = "libinterceptor.so";
pub const DEFAULT_INSTRUMENTATION_LIBRARY: &str = "libgapii.so";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ToolingError {
    #[error("no library directory configured for {0}")]
    NoLibrariesForAbi(Abi),
    #[error("expected <abi>=<directory>, got {0:?}")]
    MalformedEntry(String),
    #[error(transparent)]
    UnknownAbi(#[from] UnknownAbi),
}

/// Device-side directory holding the injected libraries, per ABI.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolingPaths {
    libs: BTreeMap<Abi, String>,
}

impl ToolingPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_libs_dir(mut self, abi: Abi, dir: impl Into<String>) -> Self {
        self.insert(abi, dir);
        self
    }

    pub fn insert(&mut self, abi: Abi, dir: impl Into<String>) {
        let dir = dir.into();
        let dir = dir.trim_end_matches('/');
        self.libs.insert(abi, dir.to_string());
    }

    pub fn libs_dir(&self, abi: Abi) -> Result<&str, ToolingError> {
        self.libs
            .get(&abi)
            .map(String::as_str)
            .ok_or(ToolingError::NoLibrariesForAbi(abi))
    }

    pub fn abis(&self) -> impl Iterator<Item = Abi> + '_ {
        self.libs.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.libs.is_empty()
    }
}

/// One `<abi>=<directory>` entry, as accepted on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibsDirEntry {
    pub abi: Abi,
    pub dir: String,
}

impl FromStr for LibsDirEntry {
    type Err = ToolingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The directory is joined with a file name, so "/" alone is no directory.
        let (abi, dir) = s
            .split_once('=')
            .map(|(abi, dir)| (abi, dir.trim_end_matches('/')))
            .filter(|(_, dir)| !dir.is_empty())
            .ok_or_else(|| ToolingError::MalformedEntry(s.to_string()))?;
        Ok(Self {
            abi: abi.parse()?,
            dir: dir.to_string(),
        })
    }
}

impl FromIterator<LibsDirEntry> for ToolingPaths {
    fn from_iter<I: IntoIterator<Item = LibsDirEntry>>(iter: I) -> Self {
        let mut paths = ToolingPaths::new();
        for entry in iter {
            paths.insert(entry.abi, entry.dir);
        }
        paths
    }
}

/// File names of the two libraries loaded into the target, in load order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibraryDescriptors {
    /// Loaded first; hooks the loader so the instrumentation library can
    /// intercept native calls.
    pub interceptor: String,
    /// Loaded second; dials the back channel once initialised.
    pub instrumentation: String,
}

impl Default for LibraryDescriptors {
    fn default() -> Self {
        Self {
            interceptor: DEFAULT_INTERCEPTOR_LIBRARY.to_string(),
            instrumentation: DEFAULT_INSTRUMENTATION_LIBRARY.to_string(),
        }
    }
}

/// Absolute device paths of both libraries for one ABI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibraryPaths {
    pub interceptor: String,
    pub instrumentation: String,
}

impl LibraryDescriptors {
    pub fn paths(&self, tooling: &ToolingPaths, abi: Abi) -> Result<LibraryPaths, ToolingError> {
        let dir = tooling.libs_dir(abi)?;
        Ok(LibraryPaths {
            interceptor: format!("{dir}/{}", self.interceptor),
            instrumentation: format!("{dir}/{}", self.instrumentation),
        })
    }
}

impl fmt::Display for LibraryPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.interceptor, self.instrumentation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_paths_join_the_abi_directory() {
        let tooling = ToolingPaths::new()
            .with_libs_dir(Abi::Arm64V8a, "/data/app/com.example.tools-1/lib/arm64/");
        let paths = LibraryDescriptors::default()
            .paths(&tooling, Abi::Arm64V8a)
            .unwrap();
        assert_eq!(
            paths.interceptor,
            "/data/app/com.example.tools-1/lib/arm64/libinterceptor.so"
        );
        assert_eq!(
            paths.instrumentation,
            "/data/app/com.example.tools-1/lib/arm64/libgapii.so"
        );

        assert_eq!(
            LibraryDescriptors::default().paths(&tooling, Abi::X86),
            Err(ToolingError::NoLibrariesForAbi(Abi::X86))
        );
    }

    #[test]
    fn parses_command_line_entries() {
        let tooling: ToolingPaths = ["arm64-v8a=/a/lib/arm64", "x86=/a/lib/x86"]
            .into_iter()
            .map(|s| s.parse::<LibsDirEntry>().unwrap())
            .collect();
        assert_eq!(tooling.abis().collect::<Vec<_>>(), vec![Abi::Arm64V8a, Abi::X86]);
        assert_eq!(tooling.libs_dir(Abi::X86), Ok("/a/lib/x86"));

        assert!(matches!(
            "arm64-v8a".parse::<LibsDirEntry>(),
            Err(ToolingError::MalformedEntry(_))
        ));
        assert!(matches!(
            "sparc=/a/lib".parse::<LibsDirEntry>(),
            Err(ToolingError::UnknownAbi(_))
        ));
    }

    #[test]
    fn rejects_directories_that_are_only_slashes() {
        for entry in ["arm64-v8a=/", "arm64-v8a=//", "arm64-v8a="] {
            assert_eq!(
                entry.parse::<LibsDirEntry>(),
                Err(ToolingError::MalformedEntry(entry.to_string())),
                "{entry}"
            );
        }
        assert_eq!("x86=/a/lib/".parse::<LibsDirEntry>().unwrap().dir, "/a/lib");
    }
}
