//! Property-based tests

mod compaction_proptest;
mod local_refs_proptest;
