pub mod config;
pub mod error;
pub mod events;
pub mod io;
pub mod state;
