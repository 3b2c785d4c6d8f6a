use crate::ffi;
use std::ffi::CStr;

/// Returns the SQLite version as an integer; e.g., `3016002` for version
/// 3.16.2.
#[inline]
pub fn version_number() -> i32 {
    unsafe { ffi::sqlite3_libversion_number() }
}

/// Returns the SQLite version as a string; e.g., `"3.16.2"` for version
/// 3.16.2.
#[inline]
pub fn version() -> &'static str {
    let cstr = unsafe { CStr::from_ptr(ffi::sqlite3_libversion()) };
    cstr.to_str()
        .expect("SQLite version string is not valid UTF8 ?!")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_version() {
        assert!(version_number() >= 3_000_000);
        assert!(version().starts_with('3'));
    }
}
