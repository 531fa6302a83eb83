//! Built-in device variants

pub mod kodi;

pub use kodi::KodiVariant;
