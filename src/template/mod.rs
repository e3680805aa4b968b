//! Template rendering (spec §4.4, §4.5): a minijinja environment extended
//! with confd-style context functions, include-graph cycle/depth
//! enforcement, and an mtime-keyed template cache.

pub mod context;
pub mod render;

pub use render::Renderer;
