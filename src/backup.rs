//! Online backup support, the transport behind bulk loading.

use std::marker::PhantomData;
use std::os::raw::c_int;
use std::ptr;
use std::thread;
use std::time::Duration;

use crate::error::error_from_handle;
use crate::ffi;
use crate::{Connection, Error, Result};

/// Outcome of one backup step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// The backup is complete.
    Done,
    /// The step was successful but there are still more pages to copy.
    More,
    /// Appropriate locks could not be acquired; the step can be retried.
    Busy,
    /// The source connection was writing; the step can be retried.
    Locked,
}

/// A handle to an online backup from one open database into another.
pub struct Backup<'a, 'b> {
    phantom_from: PhantomData<&'a Connection>,
    to: &'b Connection,
    b: *mut ffi::sqlite3_backup,
}

impl<'a, 'b> Backup<'a, 'b> {
    /// Open a backup of the main database of `from` into the main database
    /// of `to`. SQLite forbids other API calls on the destination while the
    /// backup runs, hence the `&mut`.
    pub fn new(from: &'a Connection, to: &'b mut Connection) -> Result<Backup<'a, 'b>> {
        let to_db = to.handle();
        let main = crate::str_to_cstring("main")?;
        let b = unsafe {
            let b = ffi::sqlite3_backup_init(
                to_db,
                main.as_ptr(),
                from.handle(),
                main.as_ptr(),
            );
            if b.is_null() {
                return Err(error_from_handle(to_db, ffi::sqlite3_errcode(to_db)));
            }
            b
        };
        Ok(Backup {
            phantom_from: PhantomData,
            to,
            b,
        })
    }

    /// Copy up to `num_pages` pages; negative copies everything remaining.
    /// `Busy` and `Locked` are transient and reported as `Ok` values.
    pub fn step(&self, num_pages: c_int) -> Result<StepResult> {
        use self::StepResult::{Busy, Done, Locked, More};

        let rc = unsafe { ffi::sqlite3_backup_step(self.b, num_pages) };
        match rc {
            ffi::SQLITE_DONE => Ok(Done),
            ffi::SQLITE_OK => Ok(More),
            ffi::SQLITE_BUSY => Ok(Busy),
            ffi::SQLITE_LOCKED => Ok(Locked),
            _ => self.to.decode_result(rc).map(|_| More),
        }
    }

    /// Run the whole backup with `step(-1)`, pausing briefly while the
    /// source is busy or locked.
    pub fn run_to_completion(&self, pause_when_contended: Duration) -> Result<()> {
        use self::StepResult::{Busy, Done, Locked, More};

        loop {
            match self.step(-1)? {
                Done => return Ok(()),
                Busy | Locked | More => thread::sleep(pause_when_contended),
            }
        }
    }
}

impl Drop for Backup<'_, '_> {
    fn drop(&mut self) {
        unsafe { ffi::sqlite3_backup_finish(self.b) };
    }
}

/// Copy the entire contents of `from` over the contents of `to`.
pub(crate) fn copy_database(from: &Connection, to: &mut Connection) -> Result<()> {
    from.ensure_open().and_then(|_| to.ensure_open())?;
    if ptr::eq(from.handle(), to.handle()) {
        return Err(Error::InvalidArgument(
            "cannot back a database up into itself".to_owned(),
        ));
    }
    let backup = Backup::new(from, to)?;
    backup.run_to_completion(Duration::from_millis(250))
}
