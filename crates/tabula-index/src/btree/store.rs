//! Block store: header page, page allocation and the page cache.

use super::constants::{
    FORMAT_VERSION, FREE_LINK_OFFSET, HEADER_MAGIC, HEADER_PAGE, INITIAL_ROOT_PAGE,
};
use super::node::{Node, NodeLayout};
use crate::disk::PageFile;
use parking_lot::Mutex;
use std::path::Path;
use tabula_buffer::{BufferPool, BufferPoolConfig, BufferPoolStats};
use tabula_common::page::is_valid_page_size;
use tabula_common::{IndexConfig, PageId, PageKind, Result, TabulaError};
use tracing::{debug, trace};

/// Root pointer and counters persisted in the header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub root: PageId,
    /// Number of node levels; 1 when the root is a leaf.
    pub height: u16,
    pub entries: u64,
}

impl TreeRoot {
    pub(crate) fn empty() -> Self {
        Self {
            root: PageId(INITIAL_ROOT_PAGE),
            height: 1,
            entries: 0,
        }
    }
}

/// Header page contents.
///
/// Layout (40 bytes, little-endian):
/// - magic: 4 bytes ("TBIX")
/// - version: 2 bytes
/// - kind: 1 byte (PageKind::Header)
/// - flags: 1 byte (bit 0 = duplicates allowed)
/// - page_size: 4 bytes
/// - key_len: 2 bytes
/// - value_len: 2 bytes
/// - root: 4 bytes
/// - height: 2 bytes
/// - reserved: 2 bytes
/// - entry_count: 8 bytes
/// - free_head: 4 bytes
/// - page_count: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub page_size: u32,
    pub key_len: u16,
    pub value_len: u16,
    pub allow_duplicates: bool,
    pub tree: TreeRoot,
    pub free_head: PageId,
    pub page_count: u32,
}

impl FileHeader {
    /// Size of the encoded header in bytes.
    pub const SIZE: usize = 40;

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&HEADER_MAGIC);
        buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[6] = PageKind::Header as u8;
        buf[7] = self.allow_duplicates as u8;
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..14].copy_from_slice(&self.key_len.to_le_bytes());
        buf[14..16].copy_from_slice(&self.value_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.tree.root.0.to_le_bytes());
        buf[20..22].copy_from_slice(&self.tree.height.to_le_bytes());
        buf[24..32].copy_from_slice(&self.tree.entries.to_le_bytes());
        buf[32..36].copy_from_slice(&self.free_head.0.to_le_bytes());
        buf[36..40].copy_from_slice(&self.page_count.to_le_bytes());
        buf
    }

    /// Deserializes from bytes, validating magic, version and page size.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let corrupted = |reason: &str| TabulaError::PageCorrupted {
            page_id: HEADER_PAGE,
            reason: reason.to_string(),
        };
        if buf.len() < Self::SIZE {
            return Err(corrupted("header truncated"));
        }
        if buf[0..4] != HEADER_MAGIC {
            return Err(corrupted("bad magic"));
        }
        if u16::from_le_bytes([buf[4], buf[5]]) != FORMAT_VERSION {
            return Err(corrupted("unsupported format version"));
        }
        if buf[6] != PageKind::Header as u8 {
            return Err(corrupted("not a header page"));
        }
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);

        let header = Self {
            page_size: u32_at(8),
            key_len: u16_at(12),
            value_len: u16_at(14),
            allow_duplicates: buf[7] & 1 != 0,
            tree: TreeRoot {
                root: PageId(u32_at(16)),
                height: u16_at(20),
                entries: u64::from_le_bytes([
                    buf[24], buf[25], buf[26], buf[27], buf[28], buf[29], buf[30], buf[31],
                ]),
            },
            free_head: PageId(u32_at(32)),
            page_count: u32_at(36),
        };
        if !is_valid_page_size(header.page_size as usize) {
            return Err(corrupted("invalid page size"));
        }
        if header.tree.height == 0 || header.tree.root.0 >= header.page_count {
            return Err(corrupted("root pointer out of range"));
        }
        Ok(header)
    }
}

/// Allocation state mirrored into the header page.
#[derive(Debug, Clone, Copy)]
struct AllocState {
    free_head: PageId,
    page_count: u32,
}

/// Page storage for one index file.
///
/// Reads are served from the page cache when possible. Writes go to the file
/// first and then refresh the cached image, so the cache never holds the only
/// copy of a page.
pub struct BlockStore {
    file: PageFile,
    pool: BufferPool,
    layout: NodeLayout,
    max_pages: u32,
    alloc: Mutex<AllocState>,
}

impl BlockStore {
    fn build_pool(config: &IndexConfig, page_size: usize) -> BufferPool {
        if config.cache_pages == 0 {
            BufferPool::auto_sized(page_size)
        } else {
            BufferPool::new(BufferPoolConfig {
                num_frames: config.cache_pages,
                page_size,
            })
        }
    }

    /// Creates a new index file with an empty root leaf.
    pub fn create(path: &Path, layout: NodeLayout, config: &IndexConfig) -> Result<(Self, TreeRoot)> {
        let file = PageFile::create(path, layout.page_size, config.fsync_enabled)?;
        let store = Self {
            file,
            pool: Self::build_pool(config, layout.page_size),
            layout,
            max_pages: config.max_pages,
            alloc: Mutex::new(AllocState {
                free_head: PageId::NULL,
                page_count: INITIAL_ROOT_PAGE + 1,
            }),
        };

        let tree = TreeRoot::empty();
        store.write_node(&Node::new(tree.root, layout, 0))?;
        store.write_header(&tree)?;
        store.sync()?;
        Ok((store, tree))
    }

    /// Opens an existing index file. The file's own page size wins over the config.
    pub fn open(path: &Path, config: &IndexConfig) -> Result<(Self, FileHeader)> {
        let prefix = PageFile::read_prefix(path, FileHeader::SIZE)?;
        let header = FileHeader::from_bytes(&prefix)?;
        let page_size = header.page_size as usize;
        let layout = NodeLayout::new(
            page_size,
            header.key_len as usize,
            header.value_len as usize,
            header.allow_duplicates,
        )?;

        let file = PageFile::open(path, page_size, config.fsync_enabled)?;
        if file.num_pages() < header.page_count {
            return Err(TabulaError::PageCorrupted {
                page_id: HEADER_PAGE,
                reason: format!(
                    "header claims {} pages, file has {}",
                    header.page_count,
                    file.num_pages()
                ),
            });
        }

        let store = Self {
            file,
            pool: Self::build_pool(config, page_size),
            layout,
            max_pages: config.max_pages,
            alloc: Mutex::new(AllocState {
                free_head: header.free_head,
                page_count: header.page_count,
            }),
        };
        Ok((store, header))
    }

    #[inline]
    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Pages currently in use by the file, header included.
    #[cfg(test)]
    pub fn page_count(&self) -> u32 {
        self.alloc.lock().page_count
    }

    /// Reads a page image, from the cache when resident.
    pub fn read_page(&self, page_id: PageId) -> Result<Box<[u8]>> {
        if let Some(guard) = self.pool.read_page(page_id) {
            return Ok(guard.to_boxed());
        }
        let data = self.file.read_page(page_id)?;
        match self.pool.load_page(page_id, &data) {
            Ok(_) => {
                self.pool.unpin_page(page_id);
            }
            Err(TabulaError::BufferPoolFull) => {
                trace!(page = %page_id, "page cache full of pinned pages, read uncached");
            }
            Err(e) => return Err(e),
        }
        Ok(data)
    }

    /// Reads a node page.
    pub fn read_node(&self, page_id: PageId) -> Result<Node> {
        if page_id.is_null() {
            return Err(TabulaError::IndexCorrupted(
                "branch points at the header page".to_string(),
            ));
        }
        Node::from_page(page_id, self.layout, self.read_page(page_id)?)
    }

    /// Writes a page image through to the file and the cache.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.file.write_page(page_id, data)?;
        self.pool.update_page(page_id, data);
        Ok(())
    }

    pub fn write_node(&self, node: &Node) -> Result<()> {
        self.write_page(node.page_id(), node.as_bytes())
    }

    /// Persists the root pointer together with the allocation state.
    pub fn write_header(&self, tree: &TreeRoot) -> Result<()> {
        let alloc = *self.alloc.lock();
        let header = FileHeader {
            page_size: self.layout.page_size as u32,
            key_len: self.layout.key_len as u16,
            value_len: self.layout.value_len as u16,
            allow_duplicates: self.layout.allow_duplicates,
            tree: *tree,
            free_head: alloc.free_head,
            page_count: alloc.page_count,
        };
        let mut page = vec![0u8; self.layout.page_size];
        page[..FileHeader::SIZE].copy_from_slice(&header.to_bytes());
        self.write_page(PageId(HEADER_PAGE), &page)
    }

    fn free_link(&self, page_id: PageId) -> Result<PageId> {
        let data = self.read_page(page_id)?;
        if PageKind::from_byte(data[0]) != Some(PageKind::Free) {
            return Err(TabulaError::PageCorrupted {
                page_id: page_id.0,
                reason: "free list points at a page in use".to_string(),
            });
        }
        let off = FREE_LINK_OFFSET;
        Ok(PageId(u32::from_le_bytes([
            data[off],
            data[off + 1],
            data[off + 2],
            data[off + 3],
        ])))
    }

    /// Reserves `count` pages, reusing freed pages before growing the file.
    ///
    /// Either every page is reserved or, on `NoStorageSpace`, none is.
    pub fn allocate_pages(&self, count: usize) -> Result<Vec<PageId>> {
        let mut alloc = self.alloc.lock();
        let mut pages = Vec::with_capacity(count);
        let mut free_head = alloc.free_head;
        while pages.len() < count && !free_head.is_null() {
            pages.push(free_head);
            free_head = self.free_link(free_head)?;
        }

        let grow = (count - pages.len()) as u64;
        let requested = alloc.page_count as u64 + grow;
        if requested > self.max_pages as u64 {
            return Err(TabulaError::NoStorageSpace {
                requested,
                limit: self.max_pages as u64,
            });
        }
        for _ in 0..grow {
            pages.push(PageId(alloc.page_count));
            alloc.page_count += 1;
        }
        alloc.free_head = free_head;
        Ok(pages)
    }

    /// Puts a page on the free list.
    ///
    /// Call only after the header no longer reaches the page.
    pub fn free_page(&self, page_id: PageId) -> Result<()> {
        let mut alloc = self.alloc.lock();
        let mut page = vec![0u8; self.layout.page_size];
        page[0] = PageKind::Free as u8;
        page[FREE_LINK_OFFSET..FREE_LINK_OFFSET + 4]
            .copy_from_slice(&alloc.free_head.0.to_le_bytes());
        self.write_page(page_id, &page)?;
        alloc.free_head = page_id;
        drop(alloc);

        self.pool.delete_page(page_id);
        trace!(page = %page_id, "page freed");
        Ok(())
    }

    /// Number of pages on the free list.
    pub fn free_count(&self) -> Result<u64> {
        let mut head = self.alloc.lock().free_head;
        let mut count = 0;
        while !head.is_null() {
            count += 1;
            head = self.free_link(head)?;
        }
        Ok(count)
    }

    /// Resets the file to a header and one empty root leaf.
    pub fn truncate_to_empty(&self) -> Result<TreeRoot> {
        {
            let mut alloc = self.alloc.lock();
            alloc.free_head = PageId::NULL;
            alloc.page_count = INITIAL_ROOT_PAGE + 1;
        }
        let tree = TreeRoot::empty();
        self.write_node(&Node::new(tree.root, self.layout, 0))?;
        self.write_header(&tree)?;
        self.file.truncate(INITIAL_ROOT_PAGE + 1)?;
        let dropped = self.pool.clear();
        debug!(dropped, path = %self.path().display(), "index file reset to empty");
        Ok(tree)
    }

    /// Pins a page in the cache, loading it if needed.
    ///
    /// Returns false when the cache has no unpinned frame left; the page is
    /// still readable, just not held.
    pub fn pin(&self, page_id: PageId) -> Result<bool> {
        if self.pool.fetch_page(page_id).is_some() {
            return Ok(true);
        }
        let data = self.file.read_page(page_id)?;
        match self.pool.load_page(page_id, &data) {
            Ok(_) => Ok(true),
            Err(TabulaError::BufferPoolFull) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn unpin(&self, page_id: PageId) {
        self.pool.unpin_page(page_id);
    }

    pub fn cache_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    /// Makes written pages durable.
    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}
