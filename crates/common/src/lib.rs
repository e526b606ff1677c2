// chatbook-common: shared document types and wire protocol for chatbook sync clients

pub mod patch;
pub mod protocol;
pub mod types;
