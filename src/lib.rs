// Este é o ponto de entrada principal da biblioteca.
// O sistema de memória fica em `core::memory`; tudo que uma máquina precisa é
// re-exportado aqui.

cfg_if::cfg_if! {
    if #[cfg(feature = "verbose")] {
        // Rastreio de instalações, ativado pela feature `verbose`.
        macro_rules! vprintf {
            ($($arg:tt)*) => { log::trace!($($arg)*) };
        }
    } else {
        macro_rules! vprintf {
            ($($arg:tt)*) => {};
        }
    }
}

// Módulos principais do projeto.
pub mod core;

// Re-exportações para facilitar o uso.
pub use crate::core::memory::{
    AddressMap, AddressSpace, AddressSpaceConfig, AddressSpaceSpecific, AnyReadDelegate,
    AnyWriteDelegate, Endianness, InstallRange, IoPort, MachinePhase, MemoryBank, MemoryContext,
    MemoryError, MemoryManager, MemoryPtr, MemoryResult, NativeAccess, ReadDelegate, ReadOrWrite,
    SpaceId, WriteDelegate,
};

/// Versão da biblioteca.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Função conveniente para criar um gerenciador de memória vazio.
pub fn create_manager() -> MemoryManager {
    MemoryManager::new()
}
