//! Base types shared by every layer of reef.
//!
//! The block layer addresses opaque chunks by the [32-byte Keccak-256
//! hash](Hash) of their content. Mutable state is layered on top of that via
//! feeds, which are identified by a [`Topic`] and the [`Owner`] address of
//! the single writer allowed to append to them.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod hash;
mod key;

pub use self::hash::Hash;
pub use self::key::{Owner, Topic};
