//! Storage types and helpers.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

const BUFFER_SIZE: usize = 64 * 1024;

/// A published artifact as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Pipeline stage that produced the artifact.
    pub stage: String,
    pub filename: String,
    pub url: String,
    pub size_bytes: u64,
    pub md5: String,
    pub sha256: String,
}

/// Size and checksums of a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size_bytes: u64,
    pub md5: String,
    pub sha256: String,
}

/// Stream a file once, computing md5 and sha256 together.
pub async fn digest_file(path: &Path) -> std::io::Result<FileDigest> {
    let file = File::open(path).await?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut buffer = vec![0u8; BUFFER_SIZE];

    let mut md5 = md5::Context::new();
    let mut sha256 = Sha256::new();
    let mut size_bytes = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        md5.consume(&buffer[..bytes_read]);
        sha256.update(&buffer[..bytes_read]);
        size_bytes += bytes_read as u64;
    }

    Ok(FileDigest {
        size_bytes,
        md5: format!("{:x}", md5.compute()),
        sha256: format!("{:x}", sha256.finalize()),
    })
}

/// Expand a storage path template.
///
/// Supports `{rid}`, `{stage}` and `{filename}`; the filename is URL-encoded.
pub fn render_path(template: &str, rid: &str, stage: &str, filename: &str) -> String {
    template
        .replace("{rid}", rid)
        .replace("{stage}", stage)
        .replace("{filename}", &urlencoding::encode(filename))
}
