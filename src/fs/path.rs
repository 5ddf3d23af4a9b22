//! Bounded path buffers and lexical path algebra.
//!
//! Paths are byte strings; the kernel never interprets them as UTF-8. All
//! operations work on caller-owned fixed buffers and never allocate.

use core::fmt;

use arrayvec::ArrayVec;

use crate::{
    err::{Errno, KResult},
    param::PATH_MAX,
};

/// The character used as a path separator.
pub const PATH_SEPARATOR: u8 = b'/';

/// An owned, bounded file path.
#[derive(Clone, PartialEq, Eq)]
pub struct PathBuf {
    inner: ArrayVec<u8, PATH_MAX>,
}

impl PathBuf {
    /// The root path, `/`.
    pub fn root() -> Self {
        let mut inner = ArrayVec::new();
        inner.push(PATH_SEPARATOR);
        Self { inner }
    }

    /// Builds a path from raw bytes. Fails with `NameTooLong` past `PATH_MAX`
    /// and `BadArg` on embedded NUL.
    pub fn from_bytes(bytes: &[u8]) -> KResult<Self> {
        if bytes.contains(&0) {
            return Err(Errno::BadArg);
        }
        let mut inner = ArrayVec::new();
        inner
            .try_extend_from_slice(bytes)
            .map_err(|_| Errno::NameTooLong)?;
        Ok(Self { inner })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_absolute(&self) -> bool {
        self.inner.first() == Some(&PATH_SEPARATOR)
    }

    /// Non-empty components, left to right. Repeated separators collapse.
    pub fn components(&self) -> impl Iterator<Item = &[u8]> {
        self.inner
            .split(|b| *b == PATH_SEPARATOR)
            .filter(|c| !c.is_empty())
    }

    /// Resolves `.` and `..` against the path itself. The input must be
    /// absolute; `..` at the root is a no-op, so the result never escapes
    /// `/`. Canonical output has no trailing separator except for `/`.
    pub fn canonicalize(&self) -> KResult<Self> {
        if !self.is_absolute() {
            return Err(Errno::BadArg);
        }
        let mut out = Self::root();
        for comp in self.components() {
            match comp {
                b"." => {}
                b".." => out.pop_component(),
                name => out.push_component(name)?,
            }
        }
        Ok(out)
    }

    /// Joins `rel` onto this path: an absolute `rel` replaces it, a relative
    /// one is appended. The result is canonical.
    pub fn join(&self, rel: &[u8]) -> KResult<Self> {
        if rel.first() == Some(&PATH_SEPARATOR) {
            return Self::from_bytes(rel)?.canonicalize();
        }
        let mut raw = self.clone();
        if raw.inner.last() != Some(&PATH_SEPARATOR) {
            raw.inner.try_push(PATH_SEPARATOR).map_err(|_| Errno::NameTooLong)?;
        }
        raw.inner
            .try_extend_from_slice(rel)
            .map_err(|_| Errno::NameTooLong)?;
        if raw.inner.contains(&0) {
            return Err(Errno::BadArg);
        }
        raw.canonicalize()
    }

    /// Appends a single component, separator included.
    pub fn push_component(&mut self, name: &[u8]) -> KResult<()> {
        if self.inner.last() != Some(&PATH_SEPARATOR) {
            self.inner.try_push(PATH_SEPARATOR).map_err(|_| Errno::NameTooLong)?;
        }
        self.inner
            .try_extend_from_slice(name)
            .map_err(|_| Errno::NameTooLong)
    }

    /// Drops the final component; `/` stays `/`.
    pub fn pop_component(&mut self) {
        while self.inner.len() > 1 && self.inner.last() == Some(&PATH_SEPARATOR) {
            self.inner.pop();
        }
        while self.inner.len() > 1 && self.inner.last() != Some(&PATH_SEPARATOR) {
            self.inner.pop();
        }
        while self.inner.len() > 1 && self.inner.last() == Some(&PATH_SEPARATOR) {
            self.inner.pop();
        }
    }

    /// The path without its final component.
    pub fn parent(&self) -> Self {
        let mut p = self.clone();
        p.pop_component();
        p
    }

    /// The final component, `None` for `/`.
    pub fn file_name(&self) -> Option<&[u8]> {
        self.components().last()
    }

    /// The mountpoint form: canonical with a forced trailing separator.
    pub fn to_mountpoint(&self) -> KResult<Self> {
        let mut m = self.canonicalize()?;
        if m.inner.last() != Some(&PATH_SEPARATOR) {
            m.inner.try_push(PATH_SEPARATOR).map_err(|_| Errno::NameTooLong)?;
        }
        Ok(m)
    }
}

impl fmt::Debug for PathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.inner.iter() {
            fmt::Write::write_char(f, b as char)?;
        }
        Ok(())
    }
}

impl fmt::Display for PathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
