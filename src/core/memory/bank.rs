//! Switchable memory banks.

use crate::core::memory::handler::merge_word;
use crate::core::memory::pointer::MemoryPtr;
use crate::core::memory::word::NativeWord;
use crate::core::memory::{MemoryError, MemoryResult, Offset, ReadOrWrite, SpaceId};
use log::debug;
use std::cell::RefCell;
use std::fmt;

/// Callback fired once when a bank receives its first base pointer.
pub type BankNotifier = Box<dyn FnOnce(&MemoryPtr)>;

struct BankState {
    baseptr: Option<MemoryPtr>,
    entries: Vec<Option<MemoryPtr>>,
    curentry: i32,
    references: Vec<(SpaceId, ReadOrWrite)>,
    notifiers: Vec<BankNotifier>,
}

/// Named indirection to one of several candidate base pointers.
///
/// Handlers built over a bank fetch the current base on every access, so
/// switching entries never touches the dispatch trees.
pub struct MemoryBank {
    tag: String,
    name: String,
    anonymous: bool,
    addrstart: Offset,
    addrend: Offset,
    state: RefCell<BankState>,
}

impl MemoryBank {
    /// Creates a bank; without a tag it is anonymous and named after `index`.
    pub fn new(index: usize, addrstart: Offset, addrend: Offset, tag: Option<&str>) -> Self {
        let anonymous = tag.is_none();
        let (tag, name) = match tag {
            Some(tag) => (tag.to_string(), format!("Bank '{}'", tag)),
            None => (format!("~{}~", index), format!("Internal bank #{}", index)),
        };
        Self {
            anonymous,
            tag,
            name,
            addrstart,
            addrend,
            state: RefCell::new(BankState {
                baseptr: None,
                entries: Vec::new(),
                curentry: 0,
                references: Vec::new(),
                notifiers: Vec::new(),
            }),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn addrstart(&self) -> Offset {
        self.addrstart
    }

    pub fn addrend(&self) -> Offset {
        self.addrend
    }

    /// Current base pointer, if any.
    pub fn base(&self) -> Option<MemoryPtr> {
        self.state.borrow().baseptr.clone()
    }

    /// Index of the selected entry.
    pub fn entry(&self) -> i32 {
        self.state.borrow().curentry
    }

    pub fn entry_count(&self) -> usize {
        self.state.borrow().entries.len()
    }

    #[inline]
    pub(crate) fn read<W: NativeWord>(&self, index: usize) -> W {
        self.state
            .borrow()
            .baseptr
            .as_ref()
            .and_then(|ptr| ptr.read::<W>(index))
            .unwrap_or_default()
    }

    #[inline]
    pub(crate) fn write<W: NativeWord>(&self, index: usize, data: W, mask: W) {
        if let Some(ptr) = self.state.borrow().baseptr.as_ref() {
            merge_word(ptr, index, data, mask);
        }
    }

    /// True when the bank was created for exactly this range.
    pub fn matches_exactly(&self, addrstart: Offset, addrend: Offset) -> bool {
        self.addrstart == addrstart && self.addrend == addrend
    }

    /// True when some reference of `space` matches `readorwrite`; a
    /// `READWRITE` query matches any reference of the space.
    pub fn references_space(&self, space: SpaceId, readorwrite: ReadOrWrite) -> bool {
        self.state
            .borrow()
            .references
            .iter()
            .any(|&(id, rw)| id == space && (readorwrite == ReadOrWrite::READWRITE || readorwrite == rw))
    }

    pub fn add_reference(&self, space: SpaceId, readorwrite: ReadOrWrite) {
        if self.references_space(space, readorwrite) {
            return;
        }
        self.state.borrow_mut().references.push((space, readorwrite));
    }

    /// Sets the base explicitly, collapsing the entries to this single
    /// pointer and firing the pending notifiers.
    pub fn set_base(&self, base: Option<&MemoryPtr>) -> MemoryResult<()> {
        let base = base.ok_or_else(|| MemoryError::BankNullBase(self.tag.clone()))?;
        let notifiers = {
            let mut state = self.state.borrow_mut();
            state.entries = vec![Some(base.clone())];
            state.baseptr = Some(base.clone());
            std::mem::take(&mut state.notifiers)
        };
        if !notifiers.is_empty() {
            debug!("{}: notifying {} pending handler(s)", self.name, notifiers.len());
        }
        for notify in notifiers {
            notify(base);
        }
        Ok(())
    }

    /// Registers a callback for when the first base pointer arrives.
    pub fn add_notifier(&self, notifier: BankNotifier) {
        self.state.borrow_mut().notifiers.push(notifier);
    }

    /// Selects a configured entry.
    pub fn set_entry(&self, entrynum: i32) -> MemoryResult<()> {
        if self.anonymous {
            return Err(MemoryError::AnonymousBank(self.tag.clone()));
        }
        let mut state = self.state.borrow_mut();
        if entrynum < 0 || entrynum as usize >= state.entries.len() {
            return Err(MemoryError::BankEntryOutOfRange {
                tag: self.tag.clone(),
                entry: entrynum,
            });
        }
        let ptr = state.entries[entrynum as usize]
            .clone()
            .ok_or_else(|| MemoryError::InvalidBankEntry {
                tag: self.tag.clone(),
                entry: entrynum,
            })?;
        state.curentry = entrynum;
        state.baseptr = Some(ptr);
        Ok(())
    }

    /// Configures one entry; entry 0 also becomes the base if none is set.
    pub fn configure_entry(&self, entrynum: i32, base: MemoryPtr) -> MemoryResult<()> {
        if entrynum < 0 {
            return Err(MemoryError::BankEntryOutOfRange {
                tag: self.tag.clone(),
                entry: entrynum,
            });
        }
        let mut state = self.state.borrow_mut();
        let entrynum = entrynum as usize;
        if entrynum >= state.entries.len() {
            state.entries.resize(entrynum + 1, None);
        }
        state.entries[entrynum] = Some(base.clone());
        if state.baseptr.is_none() && entrynum == 0 {
            state.baseptr = Some(base);
        }
        Ok(())
    }

    /// Configures `numentries` entries spaced `stride` bytes apart.
    pub fn configure_entries(&self, startentry: usize, numentries: usize, base: &MemoryPtr, stride: usize) {
        let mut state = self.state.borrow_mut();
        if startentry + numentries >= state.entries.len() {
            state.entries.resize(startentry + numentries + 1, None);
        }
        for entrynum in 0..numentries {
            state.entries[startentry + entrynum] = Some(base.add(entrynum * stride));
        }
        if state.baseptr.is_none() && startentry == 0 {
            state.baseptr = Some(base.clone());
        }
    }
}

impl fmt::Debug for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBank")
            .field("tag", &self.tag)
            .field("addrstart", &self.addrstart)
            .field("addrend", &self.addrend)
            .field("entry", &self.entry())
            .finish()
    }
}
