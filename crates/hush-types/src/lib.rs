//! Records and wire types shared by the hush client and server.

pub mod api;
pub mod events;
pub mod models;
