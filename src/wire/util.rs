use std::sync::atomic::{AtomicI32, Ordering};

/// The process-wide request id sequence.
static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Obtain a new, unique request id. Ids are monotonic per process and wrap back to 1 at `2^31`;
/// 0 is never produced.
pub(crate) fn next_request_id() -> i32 {
    loop {
        let id = REQUEST_ID.fetch_add(1, Ordering::SeqCst);
        if id > 0 {
            return id;
        }
        // The counter wrapped; race to restore it. Losing the race just retries.
        let _ = REQUEST_ID.compare_exchange(
            id.wrapping_add(1),
            1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Append a cstring (no interior NULs validated upstream) to a buffer.
pub(crate) fn put_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Read a cstring out of `bytes` starting at `*offset`, advancing it past the terminator.
pub(crate) fn get_cstring(bytes: &[u8], offset: &mut usize) -> Option<String> {
    let nul = bytes[*offset..].iter().position(|&b| b == 0)?;
    let s = std::str::from_utf8(&bytes[*offset..*offset + nul]).ok()?;
    *offset += nul + 1;
    Some(s.to_string())
}

#[cfg(test)]
mod test {
    use super::next_request_id;

    #[test]
    fn request_ids_are_unique_and_positive() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(a > 0);
        assert!(b > 0);
        assert_ne!(a, b);
    }
}
