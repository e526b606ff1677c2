// Wire formats exchanged with the chatbook backend.

pub mod updates;
pub mod ws;
