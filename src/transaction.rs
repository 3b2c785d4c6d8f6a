//! Nested savepoint protocol with commit- and release-failure recovery.
//!
//! The transaction state is a stack: a `BEGIN` sentinel at depth 0, then one
//! entry per savepoint. Savepoint names carry their creation depth
//! (`S<rand>D<depth>`), so `release`/`rollback_to` can validate a name
//! against the live stack before unwinding to that depth.

use rand::Rng;

use crate::ffi;
use crate::{Connection, Error, Result};

#[derive(Debug)]
pub(crate) enum TxEntry {
    Begin,
    Savepoint(String),
}

impl Connection {
    /// Whether a transaction (or any savepoint) is open.
    pub fn is_in_transaction(&self) -> bool {
        !self.tx.borrow().is_empty()
    }

    /// Current nesting depth; 0 outside any transaction.
    pub fn transaction_depth(&self) -> usize {
        self.tx.borrow().len()
    }

    /// Open a top-level transaction. Fails with
    /// [`Error::AlreadyInTransaction`] when one is open; use
    /// [`save_transaction_point`](Connection::save_transaction_point) to
    /// nest.
    pub fn begin_transaction(&self) -> Result<()> {
        if self.is_in_transaction() {
            return Err(Error::AlreadyInTransaction);
        }
        match self.execute("BEGIN TRANSACTION", &[]) {
            Ok(_) => {
                self.tx.borrow_mut().push(TxEntry::Begin);
                Ok(())
            }
            Err(e) => {
                // The engine may leave a half-open transaction behind some
                // failures; unwind it so the connection stays usable.
                if rollback_worthwhile(&e) {
                    let _ = self.execute("ROLLBACK", &[]);
                }
                Err(e)
            }
        }
    }

    /// Open a savepoint (starting a transaction if none is open) and return
    /// its name for [`release`](Connection::release) /
    /// [`rollback_to`](Connection::rollback_to).
    pub fn save_transaction_point(&self) -> Result<String> {
        let depth = self.transaction_depth();
        let name = format!("S{}D{}", rand::thread_rng().gen::<u16>(), depth);
        match self.execute(&format!("SAVEPOINT {}", name), &[]) {
            Ok(_) => {
                self.tx.borrow_mut().push(TxEntry::Savepoint(name.clone()));
                Ok(name)
            }
            Err(e) => {
                if rollback_worthwhile(&e) {
                    let _ = self.execute("ROLLBACK", &[]);
                    self.tx.borrow_mut().clear();
                }
                Err(e)
            }
        }
    }

    /// Release (commit) the named savepoint and everything nested inside it.
    pub fn release(&self, savepoint: &str) -> Result<()> {
        self.release_with(savepoint, true)
    }

    /// Like [`release`](Connection::release); when `rollback_on_failure` is
    /// set, a busy engine triggers a best-effort full `ROLLBACK` before the
    /// error surfaces, so the connection is out of the transaction either
    /// way.
    pub fn release_with(&self, savepoint: &str, rollback_on_failure: bool) -> Result<()> {
        let depth = self.validate_savepoint(savepoint)?;
        self.tx.borrow_mut().truncate(depth);
        match self.execute(&format!("RELEASE {}", savepoint), &[]) {
            Ok(_) => Ok(()),
            Err(e) => {
                if rollback_on_failure && is_busy(&e) {
                    let _ = self.execute("ROLLBACK", &[]);
                    self.tx.borrow_mut().clear();
                }
                Err(e)
            }
        }
    }

    /// Roll back the whole transaction.
    pub fn rollback(&self) -> Result<()> {
        self.rollback_to_point(None, false)
    }

    /// Roll back to the named savepoint, which stays open.
    pub fn rollback_to(&self, savepoint: &str) -> Result<()> {
        self.rollback_to_point(Some(savepoint), false)
    }

    /// Roll back to `savepoint` (or fully, when `None`), optionally
    /// swallowing errors.
    pub fn rollback_to_point(&self, savepoint: Option<&str>, no_throw: bool) -> Result<()> {
        let result = match savepoint {
            None => {
                let had_any = {
                    let mut tx = self.tx.borrow_mut();
                    let had_any = !tx.is_empty();
                    tx.clear();
                    had_any
                };
                if had_any {
                    self.execute("ROLLBACK", &[]).map(drop)
                } else {
                    Ok(())
                }
            }
            Some(name) => {
                let depth = self.validate_savepoint(name)?;
                // The savepoint itself survives a ROLLBACK TO.
                self.tx.borrow_mut().truncate(depth + 1);
                self.execute(&format!("ROLLBACK TO {}", name), &[]).map(drop)
            }
        };
        if no_throw {
            Ok(())
        } else {
            result
        }
    }

    /// Commit the outstanding transaction. The depth is zeroed before the
    /// `COMMIT` is attempted; if the engine rejects it (a busy commit can
    /// leave the transaction active), a best-effort `ROLLBACK` restores a
    /// coherent state and the original error surfaces, so the next
    /// [`begin_transaction`](Connection::begin_transaction) succeeds.
    pub fn commit(&self) -> Result<()> {
        self.commit_with(true)
    }

    /// See [`commit`](Connection::commit).
    pub fn commit_with(&self, rollback_on_failure: bool) -> Result<()> {
        let had_any = {
            let mut tx = self.tx.borrow_mut();
            let had_any = !tx.is_empty();
            tx.clear();
            had_any
        };
        if !had_any {
            return Ok(());
        }
        match self.execute("COMMIT", &[]) {
            Ok(_) => Ok(()),
            Err(e) => {
                if rollback_on_failure {
                    let _ = self.execute("ROLLBACK", &[]);
                }
                Err(e)
            }
        }
    }

    /// Run `action` inside a savepoint: released on success, fully rolled
    /// back when `action` fails.
    pub fn run_in_transaction<R>(
        &self,
        action: impl FnOnce(&Connection) -> Result<R>,
    ) -> Result<R> {
        let savepoint = self.save_transaction_point()?;
        match action(self) {
            Ok(value) => {
                self.release(&savepoint)?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.rollback_to_point(None, true);
                Err(e)
            }
        }
    }

    /// Parse the depth out of a savepoint name and cross-check it against
    /// the live stack.
    fn validate_savepoint(&self, name: &str) -> Result<usize> {
        let depth = name
            .rfind('D')
            .and_then(|i| name[i + 1..].parse::<usize>().ok())
            .ok_or_else(|| Error::BadSavepoint(name.to_owned()))?;
        let tx = self.tx.borrow();
        match tx.get(depth) {
            Some(TxEntry::Savepoint(current)) if current == name => Ok(depth),
            _ => Err(Error::BadSavepoint(name.to_owned())),
        }
    }
}

/// BEGIN/SAVEPOINT failures after which the engine may hold a transaction
/// open: roll back unconditionally, swallowing rollback errors.
fn rollback_worthwhile(e: &Error) -> bool {
    match e.extended_code() {
        Some(code) => matches!(
            code & 0xff,
            ffi::SQLITE_IOERR
                | ffi::SQLITE_FULL
                | ffi::SQLITE_BUSY
                | ffi::SQLITE_NOMEM
                | ffi::SQLITE_INTERRUPT
        ),
        None => false,
    }
}

fn is_busy(e: &Error) -> bool {
    matches!(e.extended_code(), Some(code) if code & 0xff == ffi::SQLITE_BUSY)
}

#[cfg(test)]
mod test {
    use crate::{Connection, Error};

    fn scratch() -> Connection {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        db
    }

    fn count(db: &Connection) -> i64 {
        db.query_scalar::<i64>("SELECT COUNT(*) FROM t", &[])
            .unwrap()
            .unwrap()
    }

    #[test]
    fn begin_commit_balances_depth() {
        let db = scratch();
        assert!(!db.is_in_transaction());
        db.begin_transaction().unwrap();
        assert!(db.is_in_transaction());
        assert_eq!(db.transaction_depth(), 1);
        db.execute_batch("INSERT INTO t VALUES (1)").unwrap();
        db.commit().unwrap();
        assert!(!db.is_in_transaction());
        assert_eq!(count(&db), 1);
    }

    #[test]
    fn nested_begin_is_rejected() {
        let db = scratch();
        db.begin_transaction().unwrap();
        assert!(matches!(
            db.begin_transaction(),
            Err(Error::AlreadyInTransaction)
        ));
        db.rollback().unwrap();
        db.begin_transaction().unwrap();
        db.commit().unwrap();
    }

    #[test]
    fn savepoint_names_carry_depth() {
        let db = scratch();
        let s0 = db.save_transaction_point().unwrap();
        assert!(s0.ends_with("D0"));
        let s1 = db.save_transaction_point().unwrap();
        assert!(s1.ends_with("D1"));
        assert_eq!(db.transaction_depth(), 2);
        db.release(&s1).unwrap();
        assert_eq!(db.transaction_depth(), 1);
        db.release(&s0).unwrap();
        assert!(!db.is_in_transaction());
    }

    #[test]
    fn release_unwinds_nested_savepoints() {
        let db = scratch();
        let s0 = db.save_transaction_point().unwrap();
        let _s1 = db.save_transaction_point().unwrap();
        let _s2 = db.save_transaction_point().unwrap();
        db.release(&s0).unwrap();
        assert_eq!(db.transaction_depth(), 0);
    }

    #[test]
    fn bad_savepoint_names_are_rejected() {
        let db = scratch();
        let s0 = db.save_transaction_point().unwrap();
        assert!(matches!(
            db.release("bogus"),
            Err(Error::BadSavepoint(_))
        ));
        assert!(matches!(
            db.release("S1D7"),
            Err(Error::BadSavepoint(_))
        ));
        db.release(&s0).unwrap();
    }

    #[test]
    fn rollback_to_keeps_savepoint_open() {
        let db = scratch();
        db.execute_batch("INSERT INTO t VALUES (1)").unwrap();
        let sp = db.save_transaction_point().unwrap();
        db.execute_batch("INSERT INTO t VALUES (2)").unwrap();
        db.rollback_to(&sp).unwrap();
        assert_eq!(count(&db), 1);
        // Still usable after the partial rollback.
        db.execute_batch("INSERT INTO t VALUES (3)").unwrap();
        db.release(&sp).unwrap();
        assert_eq!(count(&db), 2);
    }

    #[test]
    fn run_in_transaction_rolls_back_on_error() {
        let db = scratch();
        for i in 0..20 {
            db.execute_batch(&format!("INSERT INTO t VALUES ({})", i)).unwrap();
        }
        let result: Result<(), Error> = db.run_in_transaction(|c| {
            c.execute_batch("DELETE FROM t WHERE x = 1")?;
            c.run_in_transaction(|c2| {
                c2.execute_batch("DELETE FROM t WHERE x = 2")?;
                Err(Error::InvalidArgument("boom".to_owned()))
            })
        });
        assert!(result.is_err());
        assert_eq!(count(&db), 20);
        assert!(!db.is_in_transaction());
    }

    #[test]
    fn run_in_transaction_commits_on_success() {
        let db = scratch();
        db.run_in_transaction(|c| c.execute_batch("INSERT INTO t VALUES (42)"))
            .unwrap();
        assert_eq!(count(&db), 1);
        assert!(!db.is_in_transaction());
    }

    #[test]
    fn commit_without_transaction_is_noop() {
        let db = scratch();
        db.commit().unwrap();
        db.rollback().unwrap();
        assert!(!db.is_in_transaction());
    }

    #[test]
    fn balanced_sequences_return_to_zero() {
        let db = scratch();
        db.begin_transaction().unwrap();
        let s1 = db.save_transaction_point().unwrap();
        let s2 = db.save_transaction_point().unwrap();
        db.rollback_to(&s2).unwrap();
        db.release(&s2).unwrap();
        db.release(&s1).unwrap();
        db.commit().unwrap();
        assert_eq!(db.transaction_depth(), 0);
        assert!(!db.is_in_transaction());
        // Fresh transaction still works.
        db.begin_transaction().unwrap();
        db.commit().unwrap();
    }
}
