pub mod ftp;
pub mod http;
pub mod pop;
pub mod ws;

// First occurrence of a byte pattern over the logical buffer view.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
