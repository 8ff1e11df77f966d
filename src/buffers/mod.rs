//! Byte buffers for the transport.
//!
//! * [write_buffer::WriteBuffer]: fixed capacity, append-only, implements `BufMut` semantics
//!    with explicit overflow errors instead of reallocation
//! * [read_view::ReadView]: immutable, bounds checked window over shared bytes. Read position
//!    is a caller-owned [read_view::Cursor], so any number of readers can traverse one view
//! * [buffer_pool::BufferPool]: reuse of write buffers with scoped (RAII) lifetime

pub mod buffer_pool;
pub mod read_view;
pub mod write_buffer;
