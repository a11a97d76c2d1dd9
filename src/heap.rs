use parking_lot::Mutex;

use crate::error::AllocError;
use crate::free_list::{FreeList, Tier};
use crate::raw::RawMemory;
use crate::size_class::class_size;
use crate::span::SpanTable;

/// Bottom tier: whole free pages, linked through their first word.
pub(crate) struct PageHeap {
  pages: Mutex<FreeList>,
  page_level: usize,
}

impl PageHeap {
  /// Links every page of the table, lowest address first.
  pub(crate) fn new(mem: &RawMemory, spans: &SpanTable, page_level: usize) -> Self {
    let mut pages = FreeList::new();
    for idx in (0..spans.len()).rev() {
      pages.push(mem, spans.base_of(idx));
    }
    Self {
      pages: Mutex::new(pages),
      page_level,
    }
  }

  /// Takes one page off the heap and splits it into `level` objects on `central`.
  ///
  /// Called with the central lock of `level` held; takes the heap lock inside it.
  pub(crate) fn refill_one_page(
    &self,
    level: usize,
    central: &mut FreeList,
    spans: &SpanTable,
    mem: &RawMemory,
  ) -> Result<(), AllocError> {
    let mut pages = self.pages.lock();
    let Some(page) = pages.pop(mem) else {
      tracing::debug!(level, "heap exhausted");
      return Err(AllocError::OutOfMemory { level });
    };

    let idx = spans.index_of(page);
    spans.mark_in_use(idx, level);

    let page_size = 1 << self.page_level;
    for addr in (page..page + page_size).step_by(class_size(level)).rev() {
      central.push(mem, addr);
    }
    Ok(())
  }

  /// Puts a fully reclaimed page back on the heap.
  pub(crate) fn return_page(&self, idx: usize, spans: &SpanTable, mem: &RawMemory) {
    let mut pages = self.pages.lock();
    spans.mark_on_heap(idx);
    pages.push(mem, spans.base_of(idx));
  }

  pub(crate) fn free_pages(&self) -> usize {
    self.pages.lock().len()
  }

  pub(crate) fn validate(&self, mem: &RawMemory) {
    self.pages.lock().validate(mem, Tier::Heap, self.page_level);
  }

  pub(crate) fn for_each_page(&self, mem: &RawMemory, f: impl FnMut(usize)) {
    self.pages.lock().for_each(mem, f);
  }
}
