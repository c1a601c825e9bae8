use std::io::Read;

use flate2::read::GzDecoder;

/// Decompresses and unpacks a bundle, returning `(path, contents)` pairs in
/// archive order.
pub fn unpack_bundle(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut entries = Vec::new();
    for entry in archive.entries().expect("bundle entries") {
        let mut entry = entry.expect("bundle entry");
        let path = entry
            .path()
            .expect("entry path")
            .to_string_lossy()
            .into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).expect("entry contents");
        entries.push((path, contents));
    }
    entries
}
