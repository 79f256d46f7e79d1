//! MD5 content hashing for dedup.
//!
//! Files are streamed through the digest so large frames are never held in memory.

use std::fs::File;
use std::io::Read;
use std::path::Path;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Calculate the MD5 hash of a file's content as lowercase hex
pub fn calculate_file_hash(file_path: &Path) -> Result<String, String> {
    let mut file = File::open(file_path)
        .map_err(|e| format!("Failed to open file for hashing: {}", e))?;

    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| format!("Failed to read file for hashing: {}", e))?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }

    Ok(format!("{:x}", context.compute()))
}

/// Calculate the MD5 hash of in-memory content
pub fn calculate_content_hash(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}
