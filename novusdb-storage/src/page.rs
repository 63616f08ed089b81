//! Fixed-size page layout shared by meta, data, index, free and overflow pages.

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_SIZE: usize = 16;

pub const PAGE_TYPE_META: u8 = 1;
pub const PAGE_TYPE_DATA: u8 = 2;
pub const PAGE_TYPE_INDEX: u8 = 3;
pub const PAGE_TYPE_FREE: u8 = 4;
pub const PAGE_TYPE_OVERFLOW: u8 = 5;

/// A page is always exactly `PAGE_SIZE` bytes. The first `PAGE_HEADER_SIZE`
/// bytes are the shared header; everything after that is page-type specific.
#[derive(Clone)]
pub struct Page {
    pub buf: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    pub fn zeroed(page_type: u8, page_id: u32) -> Self {
        let mut page = Self {
            buf: Box::new([0u8; PAGE_SIZE]),
        };
        page.set_page_type(page_type);
        page.set_page_id(page_id);
        page.set_free_space_offset(PAGE_HEADER_SIZE as u16);
        page
    }

    pub fn from_bytes(bytes: [u8; PAGE_SIZE]) -> Self {
        Self { buf: Box::new(bytes) }
    }

    pub fn page_type(&self) -> u8 {
        self.buf[0]
    }

    pub fn set_page_type(&mut self, t: u8) {
        self.buf[0] = t;
    }

    pub fn page_id(&self) -> u32 {
        u32::from_le_bytes(self.buf[1..5].try_into().unwrap())
    }

    pub fn set_page_id(&mut self, id: u32) {
        self.buf[1..5].copy_from_slice(&id.to_le_bytes());
    }

    pub fn num_records(&self) -> u16 {
        u16::from_le_bytes(self.buf[5..7].try_into().unwrap())
    }

    pub fn set_num_records(&mut self, n: u16) {
        self.buf[5..7].copy_from_slice(&n.to_le_bytes());
    }

    pub fn free_space_offset(&self) -> u16 {
        u16::from_le_bytes(self.buf[7..9].try_into().unwrap())
    }

    pub fn set_free_space_offset(&mut self, off: u16) {
        self.buf[7..9].copy_from_slice(&off.to_le_bytes());
    }

    pub fn next_page_id(&self) -> u32 {
        u32::from_le_bytes(self.buf[9..13].try_into().unwrap())
    }

    pub fn set_next_page_id(&mut self, id: u32) {
        self.buf[9..13].copy_from_slice(&id.to_le_bytes());
    }

    pub fn free_space(&self) -> usize {
        PAGE_SIZE - self.free_space_offset() as usize
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PAGE_HEADER_SIZE..]
    }

    pub fn body(&self) -> &[u8] {
        &self.buf[PAGE_HEADER_SIZE..]
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_type", &self.page_type())
            .field("page_id", &self.page_id())
            .field("num_records", &self.num_records())
            .field("free_space_offset", &self.free_space_offset())
            .field("next_page_id", &self.next_page_id())
            .finish()
    }
}
