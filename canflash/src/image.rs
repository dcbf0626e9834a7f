//! Page-aligned firmware image.

use crate::error::{Error, Result};

/// Highest page count `param1` can carry in `WriteCrc`.
pub const MAX_PAGES: usize = u16::MAX as usize;

/// Firmware image padded with zeros to a whole number of pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    len: usize,
    page_size: usize,
}

impl FirmwareImage {
    /// Build an image from raw bytes.
    ///
    /// `page_size` must be a nonzero multiple of 4.
    pub fn new(data: impl Into<Vec<u8>>, page_size: usize) -> Result<Self> {
        if page_size == 0 || page_size % 4 != 0 {
            return Err(Error::Config(format!(
                "page size must be a nonzero multiple of 4, got {page_size}"
            )));
        }

        let mut data = data.into();
        let len = data.len();
        if len == 0 {
            return Err(Error::EmptyImage);
        }

        let pages = len.div_ceil(page_size);
        if pages > MAX_PAGES {
            return Err(Error::ImageTooLarge {
                pages,
                max: MAX_PAGES,
            });
        }

        data.resize(pages * page_size, 0);
        Ok(Self {
            data,
            len,
            page_size,
        })
    }

    /// Length of the image before padding.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; empty images are rejected on construction.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length after padding to the page boundary.
    pub fn padded_len(&self) -> usize {
        self.data.len()
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.data.len() / self.page_size
    }

    /// Raw bytes of one page.
    pub fn page(&self, index: usize) -> &[u8] {
        let start = index * self.page_size;
        &self.data[start..start + self.page_size]
    }

    /// Words of one page in transmission order.
    ///
    /// Each word is the next four image bytes, reversed.
    pub fn page_words(&self, index: usize) -> impl Iterator<Item = [u8; 4]> + '_ {
        self.page(index)
            .chunks_exact(4)
            .map(|c| [c[3], c[2], c[1], c[0]])
    }

    /// Padded image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
