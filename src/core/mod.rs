//! Módulos do núcleo de emulação.

pub mod memory;
