//! Settings shared by the `evalq` engine and front ends.

pub mod settings;
