//! Persistent federation state.
//!
//! # File layout
//!
//! ```text
//! magic "MFED" | u16 file version | u64 saved_at_ms
//! section: u16 version | u32 length | postcard body     (federation descriptor)
//! section: u16 version | u32 length | postcard body     (job index)
//! section: u16 version | u32 length | postcard body     (dependency placeholders)
//! ```
//!
//! All integers are big-endian. Saves write a sibling temp file and rename
//! it over the old one, so a crash leaves either the old or the new state.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tracing::info;
use tracing::warn;

use crate::constants::STATE_FILE_MAGIC;
use crate::constants::STATE_FILE_NAME;
use crate::constants::STATE_FILE_VERSION;
use crate::dependency::DependencySnapshot;
use crate::error::CodecSnafu;
use crate::error::FederationError;
use crate::error::Result;
use crate::error::SectionTooLargeSnafu;
use crate::error::StateCorruptSnafu;
use crate::error::StateIoSnafu;
use crate::federation::FederationDescriptor;
use crate::job_index::JobIndexEntry;

/// Everything the manager restores after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub saved_at_ms: u64,
    /// Last known federation membership.
    pub descriptor: Option<FederationDescriptor>,
    pub jobs: Vec<JobIndexEntry>,
    pub dependencies: DependencySnapshot,
}

/// Reads and writes the state file in one directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    ignore_errors: bool,
}

impl StateStore {
    /// `ignore_errors` turns an unreadable or corrupt file into empty state.
    pub fn new(state_dir: &Path, ignore_errors: bool) -> Self {
        Self {
            path: state_dir.join(STATE_FILE_NAME),
            ignore_errors,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the state file.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let bytes = encode_state(state)?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).context(StateIoSnafu { path: dir })?;
        }

        let tmp = self.path.with_extension("new");
        {
            let mut file = std::fs::File::create(&tmp).context(StateIoSnafu { path: &tmp })?;
            file.write_all(&bytes).context(StateIoSnafu { path: &tmp })?;
            file.sync_all().context(StateIoSnafu { path: &tmp })?;
        }
        std::fs::rename(&tmp, &self.path).context(StateIoSnafu { path: &self.path })?;
        info!(path = %self.path.display(), jobs = state.jobs.len(), bytes = bytes.len(), "federation state saved");
        Ok(())
    }

    /// Load the state file. A missing file is not an error.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return self.recover(FederationError::StateIo {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        match decode_with(&bytes, self.ignore_errors) {
            Ok(state) => {
                info!(path = %self.path.display(), jobs = state.jobs.len(), "federation state loaded");
                Ok(Some(state))
            }
            Err(reason) => self.recover(
                StateCorruptSnafu {
                    path: self.path.clone(),
                    reason,
                }
                .build(),
            ),
        }
    }

    fn recover(&self, err: FederationError) -> Result<Option<PersistedState>> {
        if self.ignore_errors {
            warn!(error = %err, "ignoring unusable federation state, starting empty");
            return Ok(None);
        }
        Err(err)
    }
}

/// Length prefix of a section body.
fn section_len(section: &str, size: usize) -> Result<u32> {
    u32::try_from(size).map_err(|_| SectionTooLargeSnafu { section, size }.build())
}

fn write_section<T: Serialize>(out: &mut Vec<u8>, section: &str, value: &T) -> Result<()> {
    let body = postcard::to_stdvec(value).context(CodecSnafu)?;
    let len = section_len(section, body.len())?;
    out.extend_from_slice(&STATE_FILE_VERSION.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// Serialize `state` into the file layout.
pub fn encode_state(state: &PersistedState) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(STATE_FILE_MAGIC);
    out.extend_from_slice(&STATE_FILE_VERSION.to_be_bytes());
    out.extend_from_slice(&state.saved_at_ms.to_be_bytes());
    write_section(&mut out, "descriptor", &state.descriptor)?;
    write_section(&mut out, "job index", &state.jobs)?;
    write_section(&mut out, "dependency", &state.dependencies)?;
    Ok(out)
}

/// Cursor over the raw file bytes.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &str) -> std::result::Result<&'a [u8], String> {
        if self.bytes.len() < len {
            return Err(format!("truncated {what}"));
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    fn u16(&mut self, what: &str) -> std::result::Result<u16, String> {
        let raw = self.take(2, what)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self, what: &str) -> std::result::Result<u32, String> {
        let raw = self.take(4, what)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self, what: &str) -> std::result::Result<u64, String> {
        let raw = self.take(8, what)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_be_bytes(buf))
    }

    fn section<T: DeserializeOwned>(&mut self, what: &str) -> std::result::Result<T, SectionError> {
        let version = self.u16(what).map_err(SectionError::Fatal)?;
        let len = self.u32(what).map_err(SectionError::Fatal)? as usize;
        let body = self.take(len, what).map_err(SectionError::Fatal)?;
        if version == 0 || version > STATE_FILE_VERSION {
            return Err(SectionError::Skippable(format!("unsupported {what} section version {version}")));
        }
        postcard::from_bytes(body).map_err(|err| SectionError::Skippable(format!("bad {what} section: {err}")))
    }
}

/// A section that cannot be used. Skippable sections can be dropped
/// individually; fatal errors leave the rest of the file unreadable.
enum SectionError {
    Skippable(String),
    Fatal(String),
}

fn read_section<T: DeserializeOwned + Default>(
    reader: &mut Reader<'_>,
    what: &str,
    lenient: bool,
) -> std::result::Result<T, String> {
    match reader.section(what) {
        Ok(value) => Ok(value),
        Err(SectionError::Skippable(reason)) if lenient => {
            warn!(section = what, %reason, "discarding unusable state section");
            Ok(T::default())
        }
        Err(SectionError::Skippable(reason) | SectionError::Fatal(reason)) => Err(reason),
    }
}

/// Parse the file layout. Errors describe what is wrong.
pub fn decode_state(bytes: &[u8]) -> std::result::Result<PersistedState, String> {
    decode_with(bytes, false)
}

/// Parse the file layout; with `lenient`, a bad section is replaced by its
/// empty value instead of failing the whole file.
fn decode_with(bytes: &[u8], lenient: bool) -> std::result::Result<PersistedState, String> {
    let mut reader = Reader { bytes };
    if reader.take(STATE_FILE_MAGIC.len(), "header")? != STATE_FILE_MAGIC {
        return Err("bad magic".to_string());
    }
    let version = reader.u16("header")?;
    if version == 0 || version > STATE_FILE_VERSION {
        return Err(format!("unsupported file version {version}"));
    }
    let saved_at_ms = reader.u64("header")?;
    let descriptor = read_section(&mut reader, "descriptor", lenient)?;
    let jobs = read_section(&mut reader, "job index", lenient)?;
    let dependencies = read_section(&mut reader, "dependency", lenient)?;
    Ok(PersistedState {
        saved_at_ms,
        descriptor,
        jobs,
        dependencies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::cid;
    use crate::testing::descriptor;
    use crate::types::FederationMetadata;
    use crate::types::JobId;
    use crate::types::SiblingMask;

    fn state() -> PersistedState {
        let viable: SiblingMask = [cid(1), cid(2)].into_iter().collect();
        let mut metadata = FederationMetadata::new(cid(1), viable, 5);
        metadata.set_active(viable);
        metadata.set_lock(cid(2));
        PersistedState {
            saved_at_ms: 1234,
            descriptor: Some(descriptor(&[1, 2])),
            jobs: vec![JobIndexEntry {
                job_id: JobId::new(cid(1), 1).unwrap(),
                metadata,
            }],
            dependencies: DependencySnapshot::default(),
        }
    }

    #[test]
    fn test_section_length_is_checked() {
        assert_eq!(section_len("jobs", 12).unwrap(), 12);
        assert_eq!(section_len("jobs", u32::MAX as usize).unwrap(), u32::MAX);
        let err = section_len("jobs", u32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, FederationError::SectionTooLarge { ref section, .. } if section == "jobs"), "{err}");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), false);
        assert_eq!(store.load().unwrap(), None);

        store.save(&state()).unwrap();
        assert_eq!(store.load().unwrap(), Some(state()));
        assert!(!store.path().with_extension("new").exists());
    }

    #[test]
    fn test_corrupt_file_is_rejected_unless_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), false);
        std::fs::write(store.path(), b"not a state file").unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, FederationError::StateCorrupt { .. }), "{err}");

        let lenient = StateStore::new(dir.path(), true);
        assert_eq!(lenient.load().unwrap(), None);
    }

    #[test]
    fn test_truncated_and_future_versions() {
        let bytes = encode_state(&state()).unwrap();
        assert!(decode_state(&bytes[..bytes.len() - 3]).unwrap_err().contains("truncated"));

        let mut future = bytes.clone();
        future[4..6].copy_from_slice(&(STATE_FILE_VERSION + 1).to_be_bytes());
        assert!(decode_state(&future).unwrap_err().contains("unsupported file version"));

        let mut bad_section = bytes;
        // First section header follows magic, version and timestamp.
        bad_section[14..16].copy_from_slice(&99u16.to_be_bytes());
        assert!(decode_state(&bad_section).unwrap_err().contains("descriptor section version"));

        // Lenient decoding drops only the unusable section.
        let partial = decode_with(&bad_section, true).unwrap();
        assert_eq!(partial.descriptor, None);
        assert_eq!(partial.jobs, state().jobs);
    }
}
