// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Guest audio buffers described by a page directory.
//!
//! The frontend grants every page of the buffer and lists the grant
//! references in a chain of directory pages:
//!
//! ```text
//! +-----------------------+      +-----------------------+
//! | gref_dir_next_page  --+----->| gref_dir_next_page = 0|
//! | gref[0]               |      | gref[1023]            |
//! | ...                   |      | ...                   |
//! | gref[1022]            |      | gref[n - 1]           |
//! +-----------------------+      +-----------------------+
//! ```
//!
//! The number of valid entries is implied by the buffer size: every page
//! but the last is full.

use std::mem::size_of;

use vm_memory::{Bytes, Le32, VolatileSlice};

use crate::{
    sndif::{XenSndPageDirectoryHeader, XENSND_GREFS_PER_DIR_PAGE, XEN_PAGE_SIZE},
    xen::{GrantMapper, GrantMapping, GrantRef},
    Error, Result,
};

/// Walk the page directory starting at `directory` and return the grant
/// references of a `size` bytes buffer, in order.
pub fn resolve_grant_refs(
    mapper: &dyn GrantMapper,
    directory: GrantRef,
    size: usize,
) -> Result<Vec<GrantRef>> {
    let expected = size.div_ceil(XEN_PAGE_SIZE);
    let mut grefs = Vec::with_capacity(expected);
    let mut next = directory;

    // Every directory page contributes at least one entry, so the walk is
    // bounded even if the guest links the chain into a loop.
    while grefs.len() < expected {
        if next == 0 {
            return Err(Error::PageDirectoryTruncated {
                expected,
                found: grefs.len(),
            });
        }
        let page = mapper.map_page(next)?;
        let slice = page.as_volatile_slice();
        let header: XenSndPageDirectoryHeader = slice.read_obj(0)?;

        let count = (expected - grefs.len()).min(XENSND_GREFS_PER_DIR_PAGE);
        for i in 0..count {
            let gref: Le32 =
                slice.read_obj(size_of::<XenSndPageDirectoryHeader>() + i * size_of::<Le32>())?;
            grefs.push(gref.into());
        }
        log::trace!(
            "page directory {}: {} grant references, next {}",
            next,
            count,
            u32::from(header.gref_dir_next_page)
        );
        next = header.gref_dir_next_page.into();
    }

    Ok(grefs)
}

/// A guest buffer mapped for the lifetime of an open stream.
///
/// Dropping it releases the mapping.
pub struct GrantedBuffer {
    mapping: Box<dyn GrantMapping>,
    grefs: Vec<GrantRef>,
    size: usize,
}

impl std::fmt::Debug for GrantedBuffer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(GrantedBuffer))
            .field("grefs", &self.grefs)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl GrantedBuffer {
    /// Resolve the page directory at `directory` and map the whole buffer.
    pub fn map(mapper: &dyn GrantMapper, directory: GrantRef, size: u32) -> Result<Self> {
        let size = size as usize;
        if size == 0 {
            return Err(Error::InvalidParameter("empty buffer".to_string()));
        }
        let grefs = resolve_grant_refs(mapper, directory, size)?;
        let mapping = mapper.map_grants(&grefs)?;
        if mapping.as_volatile_slice().len() < size {
            return Err(Error::InvalidParameter(format!(
                "mapping of {} bytes is shorter than the {} bytes buffer",
                mapping.as_volatile_slice().len(),
                size
            )));
        }
        log::debug!("mapped {} bytes in {} pages", size, grefs.len());

        Ok(Self {
            mapping,
            grefs,
            size,
        })
    }

    pub const fn len(&self) -> usize {
        self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn grefs(&self) -> &[GrantRef] {
        &self.grefs
    }

    /// The `length` bytes at `offset`, checked against the buffer size.
    pub fn slice(&self, offset: u32, length: u32) -> Result<VolatileSlice<'_>> {
        let out_of_range = || Error::BufferOutOfRange {
            offset,
            length,
            size: self.size,
        };
        let end = (offset as usize)
            .checked_add(length as usize)
            .ok_or_else(out_of_range)?;
        if end > self.size {
            return Err(out_of_range());
        }
        Ok(self
            .mapping
            .as_volatile_slice()
            .subslice(offset as usize, length as usize)?)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rstest::*;

    use super::*;
    use crate::xen::mock::MockGrantTable;

    #[rstest]
    #[case::one_byte(1)]
    #[case::one_page(XEN_PAGE_SIZE)]
    #[case::partial_page(32768 + 100)]
    #[case::full_directory_page(XENSND_GREFS_PER_DIR_PAGE * XEN_PAGE_SIZE)]
    #[case::two_directory_pages(XENSND_GREFS_PER_DIR_PAGE * XEN_PAGE_SIZE + 1)]
    fn test_resolve_grant_refs(#[case] size: usize) {
        crate::init_logger();
        let table = MockGrantTable::new(1100).unwrap();
        let buffer = table.guest_buffer(size).unwrap();

        let grefs = resolve_grant_refs(&table, buffer.directory, size).unwrap();
        assert_eq!(grefs.len(), size.div_ceil(XEN_PAGE_SIZE));
        assert_eq!(grefs, buffer.grefs);
        // Directory pages are only mapped while they are walked.
        assert_eq!(table.active_mappings(), 0);
    }

    #[test]
    fn test_resolve_empty_buffer() {
        let table = MockGrantTable::new(1).unwrap();
        assert!(resolve_grant_refs(&table, 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_truncated_chain() {
        crate::init_logger();
        let table = MockGrantTable::new(1100).unwrap();
        let size = (XENSND_GREFS_PER_DIR_PAGE + 5) * XEN_PAGE_SIZE;
        let buffer = table.guest_buffer(size).unwrap();

        // Cut the chain after the first directory page.
        table
            .page(buffer.directory)
            .unwrap()
            .write_obj(XenSndPageDirectoryHeader::default(), 0)
            .unwrap();

        assert_matches!(
            resolve_grant_refs(&table, buffer.directory, size),
            Err(Error::PageDirectoryTruncated {
                expected,
                found,
            }) if expected == XENSND_GREFS_PER_DIR_PAGE + 5 && found == XENSND_GREFS_PER_DIR_PAGE
        );
        assert_matches!(
            resolve_grant_refs(&table, 0, XEN_PAGE_SIZE),
            Err(Error::PageDirectoryTruncated {
                expected: 1,
                found: 0
            })
        );
        assert_eq!(table.active_mappings(), 0);
    }

    #[test]
    fn test_granted_buffer() {
        crate::init_logger();
        let table = MockGrantTable::new(16).unwrap();
        let guest = table.guest_buffer(3 * XEN_PAGE_SIZE).unwrap();
        table.page(guest.grefs[1]).unwrap().write_obj(0x5au8, 1).unwrap();

        let buffer = GrantedBuffer::map(&table, guest.directory, 3 * XEN_PAGE_SIZE as u32).unwrap();
        assert_eq!(table.active_mappings(), 1);
        assert_eq!(buffer.len(), 3 * XEN_PAGE_SIZE);
        assert_eq!(buffer.grefs(), guest.grefs.as_slice());

        let slice = buffer.slice(XEN_PAGE_SIZE as u32, 16).unwrap();
        assert_eq!(slice.len(), 16);
        assert_eq!(slice.read_obj::<u8>(1).unwrap(), 0x5a);

        buffer.slice(0, 3 * XEN_PAGE_SIZE as u32).unwrap();
        assert_matches!(
            buffer.slice(2 * XEN_PAGE_SIZE as u32, XEN_PAGE_SIZE as u32 + 1),
            Err(Error::BufferOutOfRange { .. })
        );
        assert_matches!(
            buffer.slice(u32::MAX, 2),
            Err(Error::BufferOutOfRange { .. })
        );

        drop(buffer);
        assert_eq!(table.active_mappings(), 0);
    }

    #[test]
    fn test_granted_buffer_invalid() {
        let table = MockGrantTable::new(16).unwrap();
        assert_matches!(
            GrantedBuffer::map(&table, 1, 0),
            Err(Error::InvalidParameter(_))
        );
        // Data grant 0 is never valid.
        let directory = table.write_directory(&[0]).unwrap();
        assert_matches!(
            GrantedBuffer::map(&table, directory, 100),
            Err(Error::GrantMapFailed(0))
        );
        assert_eq!(table.active_mappings(), 0);
    }
}
