use std::{marker::PhantomData, path::PathBuf, rc::Rc};

use crate::vfs::FsAdapter;

/// Enum of possible operations to rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOperation {
    RemoveFile(PathBuf),
    RemoveDir(PathBuf),
}
/// Active Transaction
pub struct Active;
/// Committed Transaction
pub struct Committed;
/// A trait that tells us if rollback should occur when dropped.
pub trait TransactionState {
    const SHOULD_ROLLBACK: bool;
}
impl TransactionState for Active {
    const SHOULD_ROLLBACK: bool = true;
}
impl TransactionState for Committed {
    const SHOULD_ROLLBACK: bool = false;
}
/// Journal of what a commit created on disk.
///
/// A `Transaction<Active>` dropped before [`Transaction::commit`] undoes every journaled
/// operation through the same [`FsAdapter`] that performed them, newest first. Committing
/// yields a `Transaction<Committed>` that does nothing on drop.
pub struct Transaction<State: TransactionState> {
    rollback_operations: Vec<RollbackOperation>,
    fs: Rc<dyn FsAdapter>,
    state: PhantomData<State>,
}
impl Transaction<Active> {
    pub fn new(fs: Rc<dyn FsAdapter>) -> Self {
        Transaction {
            rollback_operations: vec![],
            fs,
            state: PhantomData,
        }
    }
    /// Registers an action to reverse if the transaction is dropped uncommitted.
    pub fn add_operation(&mut self, operation: RollbackOperation) {
        self.rollback_operations.push(operation);
    }

    pub fn operations(&self) -> &[RollbackOperation] {
        &self.rollback_operations
    }
    /// Finalizes the transaction, preventing any rollback from occurring.
    pub fn commit(mut self) -> Transaction<Committed> {
        self.rollback_operations.clear();

        Transaction {
            rollback_operations: vec![],
            fs: Rc::clone(&self.fs),
            state: PhantomData,
        }
    }
}
impl<S: TransactionState> Drop for Transaction<S> {
    fn drop(&mut self) {
        if S::SHOULD_ROLLBACK && !self.rollback_operations.is_empty() {
            log::debug!("rolling back {} operations", self.rollback_operations.len());
            while let Some(operation) = self.rollback_operations.pop() {
                let outcome = match &operation {
                    RollbackOperation::RemoveDir(path) => {
                        log::debug!("removing dir: {}", path.display());
                        self.fs.remove_dir_all(path)
                    }
                    RollbackOperation::RemoveFile(path) => {
                        log::debug!("removing file: {}", path.display());
                        self.fs.remove_file(path)
                    }
                };
                if let Err(error) = outcome {
                    log::warn!("rollback of {:?} failed: {}", operation, error);
                }
            }
        } else if !S::SHOULD_ROLLBACK {
            log::debug!("committing transaction");
        }
    }
}
