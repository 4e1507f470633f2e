//! Chat Module - Nachrichtenverlauf
//!
//! Hält den lokalen Verlauf, rendert ihn als Text oder HTML und
//! exportiert ihn in eine Datei.

mod view;

pub use view::{escape_html, ChatEntry, ChatView, EntryKind, ExportFormat, CLEARED_NOTICE};
