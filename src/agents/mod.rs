//! Agents built on the `agentwire` framework.

pub mod thermal;
