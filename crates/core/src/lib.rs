//! Soundscape core: the platform-independent control plane
//!
//! Everything that changes the audio scene goes through the `Publisher`;
//! observers implement the capability traits in `domain::subscriber`.

pub mod domain;
