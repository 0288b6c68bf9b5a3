//! Page type: the engine's unit of I/O.
//!
//! A page is a fixed-size owned byte buffer tagged with a page number.
//! Whichever component holds a `Page` in memory owns it exclusively; the
//! persisted copy lives only in the file.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    page_num: u64,
    data: Vec<u8>,
}

impl Page {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_num: 0,
            data: vec![0u8; page_size],
        }
    }

    pub fn from_data(page_num: u64, data: Vec<u8>) -> Self {
        Self { page_num, data }
    }

    pub fn page_num(&self) -> u64 {
        self.page_num
    }

    pub fn set_page_num(&mut self, page_num: u64) {
        self.page_num = page_num;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_is_zero_filled() {
        let page = Page::new(1024);
        assert_eq!(page.page_num(), 0);
        assert_eq!(page.data().len(), 1024);
        assert!(page.data().iter().all(|b| *b == 0));
    }

    #[test]
    fn page_num_is_assignable() {
        let mut page = Page::new(1024);
        page.set_page_num(42);
        assert_eq!(page.page_num(), 42);
    }
}
