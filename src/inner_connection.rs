use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;

use crate::error::{error_from_handle, error_from_sqlite_code};
use crate::ffi;
use crate::raw_statement::RawStatement;
use crate::version::version_number;
use crate::{str_for_sqlite, Error, OpenFlags, Result};

/// One native database handle and nothing else: the thin call-through layer
/// to the engine entry points.
pub struct InnerConnection {
    pub db: *mut ffi::sqlite3,
}

unsafe impl Send for InnerConnection {}

impl InnerConnection {
    #[inline]
    pub unsafe fn new(db: *mut ffi::sqlite3) -> InnerConnection {
        InnerConnection { db }
    }

    pub fn open_with_flags(c_path: &CStr, flags: OpenFlags) -> Result<InnerConnection> {
        ensure_safe_sqlite_threading_mode()?;

        // Replicate the check for sane open flags from SQLite, because the
        // check in SQLite itself wasn't added until version 3.7.3.
        if (1 << (flags.bits() & 0x7)) & 0x46 == 0 {
            return Err(error_from_sqlite_code(
                ffi::SQLITE_MISUSE,
                Some("invalid combination of open flags".to_owned()),
            ));
        }

        unsafe {
            let mut db: *mut ffi::sqlite3 = ptr::null_mut();
            let r = ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags.bits(), ptr::null());
            if r != ffi::SQLITE_OK {
                let e = if db.is_null() {
                    error_from_sqlite_code(r, Some(c_path.to_string_lossy().to_string()))
                } else {
                    let e = error_from_handle(db, r);
                    ffi::sqlite3_close(db);
                    e
                };
                return Err(e);
            }

            // Extended result codes are required for the constraint taxonomy;
            // every opened connection gets them.
            let r = ffi::sqlite3_extended_result_codes(db, 1);
            if r != ffi::SQLITE_OK {
                let e = error_from_handle(db, r);
                ffi::sqlite3_close(db);
                return Err(e);
            }

            Ok(InnerConnection::new(db))
        }
    }

    #[inline]
    pub fn db(&self) -> *mut ffi::sqlite3 {
        self.db
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.db.is_null()
    }

    #[inline]
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn decode_result(&self, code: c_int) -> Result<()> {
        if code == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(unsafe { error_from_handle(self.db, code) })
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if self.db.is_null() {
            return Ok(());
        }
        // sqlite3_close_v2 defers teardown past outstanding statements;
        // prefer it on engines that have it (3.7.14).
        let r = unsafe {
            if version_number() >= 3_007_014 {
                ffi::sqlite3_close_v2(self.db)
            } else {
                ffi::sqlite3_close(self.db)
            }
        };
        let r = self.decode_result(r);
        if r.is_ok() {
            self.db = ptr::null_mut();
        }
        r
    }

    pub fn busy_timeout(&mut self, ms: c_int) -> Result<()> {
        let r = unsafe { ffi::sqlite3_busy_timeout(self.db, ms) };
        self.decode_result(r)
    }

    #[inline]
    pub fn last_insert_rowid(&self) -> i64 {
        unsafe { ffi::sqlite3_last_insert_rowid(self.db) }
    }

    #[inline]
    pub fn changes(&self) -> usize {
        unsafe { ffi::sqlite3_changes(self.db) as usize }
    }

    #[inline]
    pub fn is_autocommit(&self) -> bool {
        unsafe { ffi::sqlite3_get_autocommit(self.db) != 0 }
    }

    /// The file backing the given schema; `None` for in-memory and temporary
    /// databases.
    pub fn db_filename(&self, schema: &CStr) -> Option<String> {
        unsafe {
            let name = ffi::sqlite3_db_filename(self.db, schema.as_ptr());
            if name.is_null() {
                None
            } else {
                let s = CStr::from_ptr(name).to_string_lossy().into_owned();
                if s.is_empty() {
                    None
                } else {
                    Some(s)
                }
            }
        }
    }

    /// `sqlite3_wal_checkpoint_v2` in RESTART mode on the main database.
    pub fn wal_checkpoint_restart(&self) -> Result<()> {
        let r = unsafe {
            ffi::sqlite3_wal_checkpoint_v2(
                self.db,
                ptr::null(),
                ffi::SQLITE_CHECKPOINT_RESTART,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        self.decode_result(r)
    }

    pub fn enable_load_extension(&mut self, on: bool) -> Result<()> {
        let r = unsafe { ffi::sqlite3_enable_load_extension(self.db, on as c_int) };
        self.decode_result(r)
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.ensure_open()?;
        let c_sql = crate::str_to_cstring(sql)?;
        unsafe {
            let mut errmsg: *mut c_char = ptr::null_mut();
            let r = ffi::sqlite3_exec(
                self.db,
                c_sql.as_ptr(),
                None,
                ptr::null_mut(),
                &mut errmsg,
            );
            if r == ffi::SQLITE_OK {
                Ok(())
            } else {
                let message = if errmsg.is_null() {
                    None
                } else {
                    let m = crate::errmsg_to_string(errmsg);
                    ffi::sqlite3_free(errmsg.cast::<std::os::raw::c_void>());
                    Some(m)
                };
                Err(crate::error::classify_sqlite_error(
                    ffi::Error::new(r),
                    message,
                    Some(sql.to_owned()),
                    &[],
                ))
            }
        }
    }

    pub fn prepare(&mut self, sql: &str) -> Result<RawStatement> {
        self.ensure_open()?;
        let mut c_stmt = ptr::null_mut();
        let (c_sql, len) = str_for_sqlite(sql.as_bytes())?;
        let mut c_tail = ptr::null();
        let r = unsafe {
            ffi::sqlite3_prepare_v2(
                self.db,
                c_sql,
                len,
                &mut c_stmt as *mut *mut ffi::sqlite3_stmt,
                &mut c_tail as *mut *const c_char,
            )
        };
        // If there is an error, *ppStmt is set to NULL.
        if r != ffi::SQLITE_OK {
            return Err(unsafe {
                crate::error::error_from_handle_with_sql(self.db, r, Some(sql), &[])
            });
        }
        Ok(unsafe { RawStatement::new(c_stmt) })
    }
}

impl Drop for InnerConnection {
    #[allow(unused_must_use)]
    #[inline]
    fn drop(&mut self) {
        self.close();
    }
}

// Threading-mode checks are not necessary (and do not work) on target
// platforms that do not have threading (such as webassembly).
#[cfg(any(target_arch = "wasm32"))]
fn ensure_safe_sqlite_threading_mode() -> Result<()> {
    Ok(())
}

#[cfg(not(any(target_arch = "wasm32")))]
fn ensure_safe_sqlite_threading_mode() -> Result<()> {
    // Connections are handed across threads by the pool, so the engine must
    // have been compiled threadsafe.
    if unsafe { ffi::sqlite3_threadsafe() == 0 } {
        return Err(Error::UnsupportedOperation(
            "SQLite was compiled or configured for single-threaded use only".to_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn open_close_in_memory() {
        let path = CString::new(":memory:").unwrap();
        let mut conn = InnerConnection::open_with_flags(&path, OpenFlags::default()).unwrap();
        assert!(!conn.is_closed());
        conn.close().unwrap();
        assert!(conn.is_closed());
        assert!(matches!(conn.ensure_open(), Err(Error::Disposed)));
    }

    #[test]
    fn invalid_flag_combinations_are_rejected() {
        let path = CString::new(":memory:").unwrap();
        for bad in [
            OpenFlags::empty(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_CREATE,
        ] {
            assert!(InnerConnection::open_with_flags(&path, bad).is_err());
        }
    }

    #[test]
    fn in_memory_has_no_filename() {
        let path = CString::new(":memory:").unwrap();
        let conn = InnerConnection::open_with_flags(&path, OpenFlags::default()).unwrap();
        let main = CString::new("main").unwrap();
        assert_eq!(conn.db_filename(&main), None);
    }

    #[test]
    fn execute_batch_reports_sql() {
        let path = CString::new(":memory:").unwrap();
        let mut conn = InnerConnection::open_with_flags(&path, OpenFlags::default()).unwrap();
        let err = conn.execute_batch("NOT VALID SQL").unwrap_err();
        assert_eq!(err.sql(), Some("NOT VALID SQL"));
    }
}
