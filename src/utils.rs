//! Small helpers: human-readable sizes and async-signal-safe routines for
//! use between `fork` and `exec` in the subprocess connect drivers.

use std::os::fd::BorrowedFd;

use nix::errno::Errno;
use nix::unistd;

/// Convert a byte count to a human-readable string.
///
/// Exact multiples of powers of 1024 collapse to the appropriate extension
/// (`K`, `M`, `G`, `T`, `P`, `E`); anything else is returned as a bare byte
/// count. The boolean is true when an extension was used.
pub fn human_size(bytes: u64) -> (String, bool) {
    const EXT: [&str; 7] = ["E", "P", "T", "G", "M", "K", ""];
    let mut bytes = bytes;

    // Work out which extension to use, if any.
    let mut i = 6;
    if bytes != 0 {
        while bytes & 1023 == 0 {
            bytes >>= 10;
            i -= 1;
        }
    }

    (format!("{}{}", bytes, EXT[i]), !EXT[i].is_empty())
}

/// Like `format!("{v}")`, but safe to use between fork and exec: formats
/// into the caller's buffer and allocates nothing. The returned slice points
/// at the tail of `buf`, which must be at least 32 bytes.
///
/// Do not use this function in any other context.
pub(crate) fn fork_safe_itoa(v: i64, buf: &mut [u8]) -> &str {
    assert!(buf.len() >= 32);
    let neg = v < 0;
    let mut uv = v.unsigned_abs();
    let mut i = buf.len();

    if uv == 0 {
        i -= 1;
        buf[i] = b'0';
    } else {
        while uv > 0 {
            i -= 1;
            buf[i] = b'0' + (uv % 10) as u8;
            uv /= 10;
        }
    }
    if neg {
        i -= 1;
        buf[i] = b'-';
    }

    std::str::from_utf8(&buf[i..]).expect("digits are ASCII")
}

/// Async-signal-safe substitute for `perror`, for diagnostics on the child
/// side of a fork before `exec`. Writes `msg: errno N` to stderr with plain
/// `write(2)` calls; short writes and EINTR are ignored since we are giving
/// up anyway.
pub(crate) fn fork_safe_perror(msg: &str, errno: Errno) {
    let stderr = unsafe { BorrowedFd::borrow_raw(libc::STDERR_FILENO) };
    let mut buf = [0u8; 32];
    let num = fork_safe_itoa(errno as i64, &mut buf);
    let _ = unistd::write(stderr, msg.as_bytes());
    let _ = unistd::write(stderr, b": errno ");
    let _ = unistd::write(stderr, num.as_bytes());
    let _ = unistd::write(stderr, b"\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_size_exact_multiples() {
        assert_eq!(human_size(0), ("0".to_string(), false));
        assert_eq!(human_size(1), ("1".to_string(), false));
        assert_eq!(human_size(512), ("512".to_string(), false));
        assert_eq!(human_size(1024), ("1K".to_string(), true));
        assert_eq!(human_size(1024 * 1024), ("1M".to_string(), true));
        assert_eq!(human_size(1 << 30), ("1G".to_string(), true));
        assert_eq!(human_size(1 << 40), ("1T".to_string(), true));
        assert_eq!(human_size(1 << 50), ("1P".to_string(), true));
        assert_eq!(human_size(1 << 60), ("1E".to_string(), true));
        assert_eq!(human_size(3 << 20), ("3M".to_string(), true));
    }

    #[test]
    fn human_size_inexact() {
        assert_eq!(human_size(1025), ("1025".to_string(), false));
        assert_eq!(human_size(1048577), ("1048577".to_string(), false));
        // 1.5M is not a whole number of M, but is a whole number of K
        assert_eq!(human_size(3 << 19), ("1536K".to_string(), true));
    }

    #[test]
    fn itoa_matches_format() {
        let mut buf = [0u8; 32];
        for v in [0i64, 1, -1, 9, 10, 12345, -987654321, i64::MAX, i64::MIN] {
            assert_eq!(fork_safe_itoa(v, &mut buf), format!("{v}"));
        }
    }
}
