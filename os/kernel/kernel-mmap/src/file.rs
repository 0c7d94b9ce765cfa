//! # Backing Files
//!
//! The file side of a mapping: positional reads to fill faulted pages and
//! positional writes for write-back, the latter bracketed by a log
//! transaction.

/// An open file that can back a mapped region.
///
/// Implementations synchronize internally; a file may be shared by several
/// regions and processes at once.
pub trait BackingFile {
    /// Opened for reading.
    fn readable(&self) -> bool;

    /// Opened for writing.
    fn writable(&self) -> bool;

    /// Current size in bytes.
    fn size(&self) -> u64;

    /// Read up to `dst.len()` bytes at `offset`. Returns the bytes read.
    ///
    /// # Errors
    /// Device or file-system failure.
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize, FileError>;

    /// Write `src` at `offset`. Returns the bytes written.
    ///
    /// # Errors
    /// Device or file-system failure.
    fn write_at(&self, offset: u64, src: &[u8]) -> Result<usize, FileError>;

    /// Open a file-system transaction.
    fn begin_op(&self);

    /// Close the transaction opened by [`begin_op`](Self::begin_op).
    fn end_op(&self);
}

/// An open file-system transaction; closed on drop.
#[must_use = "the transaction ends as soon as the guard is dropped"]
pub struct Transaction<'f, F: BackingFile + ?Sized> {
    file: &'f F,
}

impl<'f, F: BackingFile + ?Sized> Transaction<'f, F> {
    pub fn begin(file: &'f F) -> Self {
        file.begin_op();
        Self { file }
    }
}

impl<F: BackingFile + ?Sized> Drop for Transaction<'_, F> {
    fn drop(&mut self) {
        self.file.end_op();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    #[error("i/o error at file offset {0:#x}")]
    Io(u64),
    #[error("short write at file offset {offset:#x}: {written} of {expected} bytes")]
    ShortWrite {
        offset: u64,
        written: usize,
        expected: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[derive(Default)]
    struct Counting {
        open: Cell<i32>,
        opened: Cell<u32>,
    }

    impl BackingFile for Counting {
        fn readable(&self) -> bool {
            true
        }
        fn writable(&self) -> bool {
            true
        }
        fn size(&self) -> u64 {
            0
        }
        fn read_at(&self, _: u64, _: &mut [u8]) -> Result<usize, FileError> {
            Ok(0)
        }
        fn write_at(&self, _: u64, src: &[u8]) -> Result<usize, FileError> {
            assert_eq!(self.open.get(), 1, "write outside a transaction");
            Ok(src.len())
        }
        fn begin_op(&self) {
            self.open.set(self.open.get() + 1);
            self.opened.set(self.opened.get() + 1);
        }
        fn end_op(&self) {
            self.open.set(self.open.get() - 1);
        }
    }

    #[test]
    fn transaction_brackets_its_scope() {
        let file = Counting::default();
        {
            let _tx = Transaction::begin(&file);
            assert_eq!(file.write_at(0, b"abc"), Ok(3));
        }
        assert_eq!(file.open.get(), 0);
        assert_eq!(file.opened.get(), 1);
    }

    #[test]
    fn works_through_a_trait_object() {
        let file = Counting::default();
        let dynamic: &dyn BackingFile = &file;
        drop(Transaction::begin(dynamic));
        assert_eq!(file.opened.get(), 1);
        assert_eq!(file.open.get(), 0);
    }
}
