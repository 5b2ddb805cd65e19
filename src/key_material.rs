//! Loading the local master key from disk.

use std::io::{self, Read, Write};
use std::path::Path;

use tracing::debug;
use zeroize::Zeroize;

use crate::error::FleError;
use crate::keys::{MasterKey, MASTER_KEY_LEN};

/// Read a local master key from `path`.
///
/// The file must contain exactly [`MASTER_KEY_LEN`] bytes. A short file is
/// never padded and a long file is never truncated: both are `FleError::Io`.
pub fn read_master_key(path: impl AsRef<Path>) -> Result<MasterKey, FleError> {
    let path = path.as_ref();
    let io_err = |source: io::Error| FleError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = std::fs::File::open(path).map_err(io_err)?;
    // One extra byte so an over-long file is detectable without reading it all.
    let mut buf = Vec::with_capacity(MASTER_KEY_LEN + 1);
    let read = Read::by_ref(&mut file)
        .take(MASTER_KEY_LEN as u64 + 1)
        .read_to_end(&mut buf);

    let outcome = match read {
        Err(source) => Err(io_err(source)),
        Ok(n) if n != MASTER_KEY_LEN => Err(io_err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {MASTER_KEY_LEN} bytes, found {}", describe_len(n)),
        ))),
        Ok(_) => {
            let mut bytes = [0u8; MASTER_KEY_LEN];
            bytes.copy_from_slice(&buf);
            let key = MasterKey::from_bytes(bytes);
            bytes.zeroize();
            Ok(key)
        }
    };
    buf.zeroize();

    if outcome.is_ok() {
        debug!(path = %path.display(), "loaded local master key");
    }
    outcome
}

/// Write `key` to a new file at `path`.
///
/// Refuses to overwrite an existing file: replacing a master key orphans
/// every data key wrapped under it.
pub fn write_master_key(path: impl AsRef<Path>, key: &MasterKey) -> Result<(), FleError> {
    let path = path.as_ref();
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .and_then(|mut file| file.write_all(key.as_bytes()).map(|_| file))
        .and_then(|file| file.sync_all())
        .map_err(|source| FleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), "wrote local master key");
    Ok(())
}

fn describe_len(n: usize) -> String {
    if n > MASTER_KEY_LEN {
        "more".to_string()
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn exact_length_file_loads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x11; MASTER_KEY_LEN]).unwrap();

        let key = read_master_key(file.path()).unwrap();
        assert_eq!(key.as_bytes(), &[0x11; MASTER_KEY_LEN]);
    }

    #[test]
    fn long_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x11; MASTER_KEY_LEN + 4]).unwrap();

        let err = read_master_key(file.path()).unwrap_err();
        assert!(matches!(err, FleError::Io { .. }));
        assert!(err.to_string().contains("found more"));
    }

    #[test]
    fn written_key_reads_back_and_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master-key.txt");
        let key = MasterKey::generate().unwrap();

        write_master_key(&path, &key).unwrap();
        assert_eq!(read_master_key(&path).unwrap().as_bytes(), key.as_bytes());

        let other = MasterKey::generate().unwrap();
        assert!(write_master_key(&path, &other).is_err());
        assert_eq!(read_master_key(&path).unwrap().as_bytes(), key.as_bytes());
    }
}
